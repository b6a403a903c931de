//! compute - pull-then-query or pushdown benchmark client

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;

use disagg_bench::cli::{Command, ComputeCli};
use disagg_bench::config::ComputeConfig;
use disagg_bench::downloader::{DownloadConfig, Downloader};
use disagg_bench::engine::{DuckDbFactory, TableNameEstimator};
use disagg_bench::logger;
use disagg_bench::metrics::mb_per_sec;
use disagg_bench::orchestrator::{FetchSummary, Orchestrator};
use disagg_bench::progress::TransferProgress;
use disagg_bench::pushdown::{PushdownClient, PushdownSummary};
use disagg_bench::queries::collect_queries;
use disagg_bench::report::{RunReport, RunReportEntry};

fn main() -> Result<()> {
    ctrlc::set_handler(move || {
        eprintln!("\n[Compute] Interrupted by user. Exiting (Ctrl-C)...");
        // 128 + SIGINT
        std::process::exit(130);
    })
    .context("set Ctrl-C handler")?;

    let cli = ComputeCli::parse();
    let cfg = cli.resolve()?;
    if let Some(path) = cli.save_config.as_deref() {
        cfg.save(path)
            .with_context(|| format!("save settings to {}", path.display()))?;
        eprintln!("[Compute] Settings written to {}", path.display());
    }
    let logger = logger::from_option(cfg.log_file.as_deref());

    let (files, queries) =
        collect_queries(&cfg.queries_dir, &cfg.query_prefix, &cfg.query_suffix)?;
    if queries.is_empty() {
        eprintln!(
            "[Compute] No {}*{} files in {}",
            cfg.query_prefix,
            cfg.query_suffix,
            cfg.queries_dir.display()
        );
        return Ok(());
    }
    eprintln!(
        "[Compute] Loaded {} queries referencing {} files",
        queries.len(),
        files.len()
    );

    match cli.command {
        Command::Fetch(_) => {
            let scratch = cfg
                .scratch_dir
                .join(format!("run-{}", uuid::Uuid::new_v4().simple()));
            let progress = TransferProgress::new(files.len() as u64, cfg.progress);
            let mut dl_cfg = DownloadConfig::new(&cfg.storage, &scratch, cfg.download_workers());
            dl_cfg.buffer_size = cfg.buffer_size();
            dl_cfg.deadlines = cfg.deadlines();
            let downloader = Downloader::new(dl_cfg)
                .with_logger(Arc::clone(&logger))
                .with_progress(progress.clone());

            let query_threads = cfg.query_workers();
            let orchestrator = Orchestrator::new(
                Arc::new(DuckDbFactory::default()),
                Arc::new(TableNameEstimator::compute_default()),
                query_threads,
                query_threads,
            )
            .with_logger(Arc::clone(&logger));

            let result = orchestrator.fetch_and_run(&downloader, &files, &queries);
            progress.finish("download complete");
            // only succeeds once every copy is gone
            let _ = std::fs::remove_dir(&scratch);
            let summary = result?;
            print_fetch_summary(&summary, query_threads);
            logger.done(
                "fetch",
                summary.totals.executed as u64,
                summary.download.total_bytes,
                summary.wall.as_secs_f64(),
            );
            write_report(&cfg, RunReportEntry::from_fetch(&summary, query_threads));
        }
        Command::Pushdown => {
            let client = PushdownClient::new(&cfg.storage)
                .with_deadlines(cfg.deadlines())
                .with_logger(Arc::clone(&logger));
            let summary = client.run(&queries);
            print_pushdown_summary(&summary);
            logger.done(
                "pushdown",
                summary.executed as u64,
                summary.total_response_bytes,
                summary.wall_seconds,
            );
            write_report(&cfg, RunReportEntry::from_pushdown(&summary));
        }
    }
    Ok(())
}

fn write_report(cfg: &ComputeConfig, entry: RunReportEntry) {
    if let Some(path) = cfg.report.as_deref() {
        if let Err(e) = RunReport::new(path).add_entry(&entry) {
            eprintln!("[Compute] warning: cannot write report {}: {:#}", path.display(), e);
        }
    }
}

fn file_name(p: &Path) -> String {
    p.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| p.display().to_string())
}

fn print_fetch_summary(s: &FetchSummary, query_threads: usize) {
    let dl_secs = s.download.elapsed.as_secs_f64();
    eprintln!("\n[Compute] ===================== Summary =====================");
    eprintln!("[Compute] Download threads used  : {}", s.download.workers);
    eprintln!("[Compute] Engine threads used    : {}", query_threads);
    eprintln!("[Compute] Files downloaded       : {}", s.download.path_map.len());
    if !s.download.shard_errors.is_empty() {
        eprintln!("[Compute] Shard errors           : {}", s.download.shard_errors.len());
    }
    eprintln!("[Compute] Total data size        : {} bytes", s.download.total_bytes);
    eprintln!("[Compute] Download time          : {:.2}s", dl_secs);
    match mb_per_sec(s.download.total_bytes, dl_secs) {
        Some(v) => eprintln!("[Compute] Download speed         : {:.2} MB/s", v),
        None => eprintln!("[Compute] Download speed         : N/A"),
    }
    eprintln!("[Compute] Queries executed       : {}", s.totals.executed);
    if s.totals.failed > 0 {
        eprintln!("[Compute] Queries failed         : {}", s.totals.failed);
    }
    eprintln!("[Compute] Total rows returned    : {}", s.totals.total_rows);
    eprintln!("[Compute] Total rows scanned     : {}", s.totals.total_scanned);
    eprintln!("[Compute] Total query time       : {:.2}s", s.totals.query_wall.as_secs_f64());
    eprintln!("[Compute] Total time (wall-clock): {:.2}s", s.wall.as_secs_f64());
    eprintln!("[Compute] CPU usage              : {:.1}%", s.cpu_usage_pct);
    eprintln!(
        "[Compute] Overall throughput     : {:.0} rows/sec (including download)",
        s.overall_throughput()
    );
    eprintln!(
        "[Compute] Query throughput       : {:.0} rows/sec (query only)",
        s.totals.query_throughput()
    );
    eprintln!("[Compute] Local copies removed   : {}", s.removed_files);

    eprintln!("\n[Compute] Per-Query Details:");
    for o in &s.totals.outcomes {
        match &o.error {
            None => eprintln!(
                "[Compute] {}: {} scanned, {:.0} rows/sec",
                file_name(&o.source),
                o.scanned,
                o.throughput()
            ),
            Some(e) => eprintln!("[Compute] {}: FAILED ({})", file_name(&o.source), e),
        }
    }
}

fn print_pushdown_summary(s: &PushdownSummary) {
    eprintln!("\n[Compute] ===================== Summary =====================");
    eprintln!("[Compute] Total queries executed   : {}", s.executed);
    if s.failed > 0 {
        eprintln!("[Compute] Queries failed           : {}", s.failed);
    }
    eprintln!("[Compute] Total scanned rows       : {}", s.total_scanned);
    eprintln!("[Compute] Total returned rows      : {}", s.total_rows);
    eprintln!("[Compute] Total data transfer time : {:.4}s", s.total_transfer_time);
    eprintln!("[Compute] Total data transfer size : {} bytes", s.total_response_bytes);
    eprintln!("[Compute] Total server query time  : {:.4}s", s.total_server_time);
    eprintln!("[Compute] Overall time (wall-clock): {:.4}s", s.wall_seconds);
    eprintln!("[Compute] Average CPU usage        : {:.2}%", s.cpu_usage_pct);
    if s.wall_seconds > 0.0 && s.total_scanned > 0 {
        eprintln!(
            "[Compute] Overall throughput       : {:.1} rows/sec (scanned).",
            s.throughput()
        );
    } else {
        eprintln!("[Compute] overall_time=0 or total_scanned=0 => cannot compute throughput.");
    }
}
