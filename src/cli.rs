//! Command-line definitions for `storaged` and `compute`

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::ComputeConfig;
use crate::protocol::{Deadlines, DEFAULT_BIND};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ServeMode {
    /// Stream requested files (thread per connection)
    Files,
    /// Execute pushed-down SQL (one connection at a time)
    Pushdown,
}

/// Storage daemon options
#[derive(Clone, Debug, Parser)]
#[command(author, version, about = "Storage node: serves files or executes pushed-down queries")]
pub struct StorageOpts {
    /// Bind address (host:port)
    #[arg(long, default_value = DEFAULT_BIND)]
    pub bind: String,

    /// Root directory requested paths resolve under
    #[arg(long, default_value = "/")]
    pub root: PathBuf,

    /// Protocol to serve
    #[arg(long, value_enum, default_value_t = ServeMode::Files)]
    pub mode: ServeMode,

    /// Bulk copy buffer in MB
    #[arg(long, default_value_t = 16)]
    pub buffer_mb: usize,

    /// Engine threads for pushdown queries (0 = all logical CPUs)
    #[arg(long, default_value_t = 0)]
    pub engine_threads: usize,

    /// DuckDB database file for pushdown mode (in-memory if omitted)
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Per-connection read deadline in ms (0 = none)
    #[arg(long, default_value_t = 0)]
    pub read_timeout_ms: u64,

    /// Per-connection write deadline in ms (0 = none)
    #[arg(long, default_value_t = 0)]
    pub write_timeout_ms: u64,

    /// Append event lines to this file
    #[arg(long = "log-file")]
    pub log_file: Option<PathBuf>,
}

impl StorageOpts {
    pub fn deadlines(&self) -> Deadlines {
        Deadlines::from_millis(0, self.read_timeout_ms, self.write_timeout_ms)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_mb.max(1) * 1024 * 1024
    }

    pub fn engine_threads(&self) -> usize {
        if self.engine_threads == 0 {
            num_cpus::get()
        } else {
            self.engine_threads
        }
    }
}

/// Compute node: pull files and query locally, or push queries to storage
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct ComputeCli {
    /// TOML settings file; flags below override it
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Storage node address (host:port)
    #[arg(long, global = true)]
    pub storage: Option<String>,

    /// Directory holding the SQL files
    #[arg(long, global = true)]
    pub queries_dir: Option<PathBuf>,

    /// Only SQL files whose name starts with this prefix
    #[arg(long, global = true)]
    pub query_prefix: Option<String>,

    /// Only SQL files whose name ends with this suffix
    #[arg(long, global = true)]
    pub query_suffix: Option<String>,

    /// Connect deadline in ms (0 = none)
    #[arg(long, global = true)]
    pub connect_timeout_ms: Option<u64>,

    /// Read deadline in ms (0 = none)
    #[arg(long, global = true)]
    pub read_timeout_ms: Option<u64>,

    /// Write deadline in ms (0 = none)
    #[arg(long, global = true)]
    pub write_timeout_ms: Option<u64>,

    /// Append event lines to this file
    #[arg(long = "log-file", global = true)]
    pub log_file: Option<PathBuf>,

    /// Append a JSON line per run to this file
    #[arg(long, global = true)]
    pub report: Option<PathBuf>,

    /// Write the effective settings (file + flags) to this TOML file
    #[arg(long, global = true)]
    pub save_config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download every referenced file, then run the queries locally
    Fetch(FetchArgs),
    /// Send each query to the storage node and collect the results
    Pushdown,
}

#[derive(Debug, Args)]
pub struct FetchArgs {
    /// Download threads (max 16); also the query pool size by default
    #[arg(short = 'd', long)]
    pub download_threads: Option<usize>,

    /// Query pool size and engine thread hint
    #[arg(long)]
    pub query_threads: Option<usize>,

    /// Local scratch directory for downloaded files
    #[arg(long)]
    pub scratch_dir: Option<PathBuf>,

    /// Bulk copy buffer in MB
    #[arg(long)]
    pub buffer_mb: Option<usize>,

    /// Show a download progress bar
    #[arg(short, long)]
    pub progress: bool,
}

impl ComputeCli {
    /// Config file (or defaults) with every explicit flag applied on top
    pub fn resolve(&self) -> Result<ComputeConfig> {
        let mut cfg = ComputeConfig::load(self.config.as_deref())?;
        if let Some(v) = &self.storage {
            cfg.storage = v.clone();
        }
        if let Some(v) = &self.queries_dir {
            cfg.queries_dir = v.clone();
        }
        if let Some(v) = &self.query_prefix {
            cfg.query_prefix = v.clone();
        }
        if let Some(v) = &self.query_suffix {
            cfg.query_suffix = v.clone();
        }
        if let Some(v) = self.connect_timeout_ms {
            cfg.connect_timeout_ms = v;
        }
        if let Some(v) = self.read_timeout_ms {
            cfg.read_timeout_ms = v;
        }
        if let Some(v) = self.write_timeout_ms {
            cfg.write_timeout_ms = v;
        }
        if let Some(v) = &self.log_file {
            cfg.log_file = Some(v.clone());
        }
        if let Some(v) = &self.report {
            cfg.report = Some(v.clone());
        }
        if let Command::Fetch(f) = &self.command {
            if let Some(v) = f.download_threads {
                cfg.download_threads = v;
            }
            if let Some(v) = f.query_threads {
                cfg.query_threads = v;
            }
            if let Some(v) = &f.scratch_dir {
                cfg.scratch_dir = v.clone();
            }
            if let Some(v) = f.buffer_mb {
                cfg.buffer_mb = v;
            }
            if f.progress {
                cfg.progress = true;
            }
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_defaults() {
        let o = StorageOpts::parse_from(["storaged"]);
        assert_eq!(o.bind, "0.0.0.0:9000");
        assert_eq!(o.root, PathBuf::from("/"));
        assert_eq!(o.mode, ServeMode::Files);
        assert_eq!(o.buffer_size(), 16 * 1024 * 1024);
        assert_eq!(o.deadlines(), Deadlines::none());
        assert!(o.engine_threads() >= 1);
    }

    #[test]
    fn storage_pushdown_mode() {
        let o = StorageOpts::parse_from(["storaged", "--mode", "pushdown", "--engine-threads", "3"]);
        assert_eq!(o.mode, ServeMode::Pushdown);
        assert_eq!(o.engine_threads(), 3);
    }

    #[test]
    fn fetch_flags_override_defaults() {
        let cli = ComputeCli::parse_from([
            "compute",
            "fetch",
            "-d",
            "8",
            "--storage",
            "192.168.1.100:9000",
            "--read-timeout-ms",
            "1500",
        ]);
        let cfg = cli.resolve().unwrap();
        assert_eq!(cfg.download_threads, 8);
        assert_eq!(cfg.query_workers(), 8);
        assert_eq!(cfg.storage, "192.168.1.100:9000");
        assert_eq!(cfg.read_timeout_ms, 1500);
        assert_eq!(cfg.query_prefix, "query6_");
    }

    #[test]
    fn saved_settings_reload_as_resolved() {
        let dir = tempfile::TempDir::new().unwrap();
        let out = dir.path().join("compute.toml");
        let cli = ComputeCli::parse_from([
            "compute",
            "fetch",
            "--query-threads",
            "6",
            "--scratch-dir",
            "/mnt/nvme/scratch",
            "--save-config",
            out.to_str().unwrap(),
        ]);
        let cfg = cli.resolve().unwrap();
        cfg.save(cli.save_config.as_deref().unwrap()).unwrap();

        let again = ComputeCli::parse_from(["compute", "pushdown", "--config", out.to_str().unwrap()]);
        let back = again.resolve().unwrap();
        assert_eq!(back, cfg);
        assert_eq!(back.query_workers(), 6);
        assert_eq!(back.scratch_dir, PathBuf::from("/mnt/nvme/scratch"));
    }

    #[test]
    fn pushdown_subcommand_parses() {
        let cli = ComputeCli::parse_from(["compute", "pushdown", "--query-prefix", "q_"]);
        assert!(matches!(cli.command, Command::Pushdown));
        assert_eq!(cli.resolve().unwrap().query_prefix, "q_");
    }
}
