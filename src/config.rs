//! Compute-side settings, loadable from a TOML file

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::downloader::clamp_workers;
use crate::protocol::{Deadlines, DEFAULT_STORAGE_ADDR};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeConfig {
    pub storage: String,
    pub queries_dir: PathBuf,
    pub query_prefix: String,
    pub query_suffix: String,
    pub scratch_dir: PathBuf,
    pub download_threads: usize,
    pub query_threads: usize, // 0 = same as download threads
    pub buffer_mb: usize,
    pub connect_timeout_ms: u64, // 0 = no deadline
    pub read_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub progress: bool,
    pub log_file: Option<PathBuf>,
    pub report: Option<PathBuf>,
}

impl Default for ComputeConfig {
    fn default() -> Self {
        Self {
            storage: DEFAULT_STORAGE_ADDR.to_string(),
            queries_dir: PathBuf::from("."),
            query_prefix: "query6_".to_string(),
            query_suffix: ".sql".to_string(),
            scratch_dir: std::env::temp_dir().join("disagg-scratch"),
            download_threads: 4,
            query_threads: 0,
            buffer_mb: 16,
            connect_timeout_ms: 0,
            read_timeout_ms: 0,
            write_timeout_ms: 0,
            progress: false,
            log_file: None,
            report: None,
        }
    }
}

impl ComputeConfig {
    /// Defaults when `path` is `None`; a named file must exist and parse
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let data = std::fs::read_to_string(p)
                    .with_context(|| format!("read config {}", p.display()))?;
                let cfg: ComputeConfig =
                    toml::from_str(&data).with_context(|| format!("parse config {}", p.display()))?;
                Ok(cfg)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&dir).ok();
        let data = toml::to_string(self)?;
        // atomic write
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        use std::io::Write as _;
        tmp.write_all(data.as_bytes())?;
        tmp.flush()?;
        tmp.persist(path)?;
        Ok(())
    }

    pub fn deadlines(&self) -> Deadlines {
        Deadlines::from_millis(
            self.connect_timeout_ms,
            self.read_timeout_ms,
            self.write_timeout_ms,
        )
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_mb.max(1) * 1024 * 1024
    }

    pub fn download_workers(&self) -> usize {
        clamp_workers(self.download_threads)
    }

    /// Query pool size and engine thread hint. Follows the requested
    /// download thread count (unclamped) unless set explicitly.
    pub fn query_workers(&self) -> usize {
        if self.query_threads > 0 {
            self.query_threads
        } else {
            self.download_threads.max(1)
        }
    }
}
