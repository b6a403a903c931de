//! Query orchestrator for the fetch-then-compute path

use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use crate::downloader::{DownloadReport, Downloader};
use crate::engine::{EngineFactory, ScanEstimator};
use crate::envelope::Row;
use crate::logger::{Logger, NoopLogger};
use crate::metrics::{rows_per_sec, CpuClock};
use crate::queries::{PathMap, QueryInfo};

#[derive(Clone, Debug, PartialEq)]
pub struct QueryOutcome {
    pub source: PathBuf,
    pub rows: u64,
    /// Estimate for the rewritten SQL; counted in totals only on success
    pub scanned: u64,
    pub seconds: f64,
    pub first_row: Option<Row>,
    pub error: Option<String>,
}

impl QueryOutcome {
    pub fn throughput(&self) -> f64 {
        rows_per_sec(self.scanned, self.seconds)
    }
}

/// Run-level aggregates over one batch of queries
#[derive(Clone, Debug, Default)]
pub struct RunTotals {
    pub executed: usize,
    pub failed: usize,
    pub total_rows: u64,
    pub total_scanned: u64,
    /// Wall time of the whole query phase
    pub query_wall: Duration,
    /// Sum of per-query execution times
    pub query_seconds: f64,
    /// Per-query results in completion order
    pub outcomes: Vec<QueryOutcome>,
}

impl RunTotals {
    fn absorb(&mut self, o: QueryOutcome) {
        self.executed += 1;
        self.query_seconds += o.seconds;
        if o.error.is_none() {
            self.total_rows += o.rows;
            self.total_scanned += o.scanned;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(o);
    }

    pub fn query_throughput(&self) -> f64 {
        rows_per_sec(self.total_scanned, self.query_wall.as_secs_f64())
    }
}

/// Everything the fetch benchmark measured
#[derive(Debug, Default)]
pub struct FetchSummary {
    pub download: DownloadReport,
    pub totals: RunTotals,
    pub wall: Duration,
    pub cpu_usage_pct: f64,
    pub removed_files: usize,
}

impl FetchSummary {
    /// Scanned rows per second including the download phase
    pub fn overall_throughput(&self) -> f64 {
        rows_per_sec(self.totals.total_scanned, self.wall.as_secs_f64())
    }
}

pub struct Orchestrator {
    factory: Arc<dyn EngineFactory>,
    estimator: Arc<dyn ScanEstimator>,
    workers: usize,
    engine_threads: usize,
    logger: Arc<dyn Logger>,
}

impl Orchestrator {
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        estimator: Arc<dyn ScanEstimator>,
        workers: usize,
        engine_threads: usize,
    ) -> Self {
        Self {
            factory,
            estimator,
            workers: workers.max(1),
            engine_threads: engine_threads.max(1),
            logger: Arc::new(NoopLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Execute every query on a pool of `workers` threads and collect the
    /// outcomes as they complete.
    pub fn run_queries(&self, queries: &[QueryInfo], path_map: &PathMap) -> Result<RunTotals> {
        let mut totals = RunTotals::default();
        let start = Instant::now();
        if queries.is_empty() {
            return Ok(totals);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .thread_name(|i| format!("query-{}", i))
            .build()
            .context("build query pool")?;

        let (tx, rx) = mpsc::channel::<QueryOutcome>();
        pool.scope(|s| {
            for q in queries {
                let tx = tx.clone();
                s.spawn(move |_| {
                    let _ = tx.send(self.execute_query(q, path_map));
                });
            }
        });
        drop(tx);

        for outcome in rx {
            totals.absorb(outcome);
        }
        totals.query_wall = start.elapsed();
        Ok(totals)
    }

    /// Rewrite, execute on a fresh engine, and time one query. Engine
    /// failures are recorded on the outcome.
    pub fn execute_query(&self, q: &QueryInfo, path_map: &PathMap) -> QueryOutcome {
        let start = Instant::now();
        let sql = q.rewrite(path_map);
        eprintln!("[Compute] Executing query from {}:\n{}", q.path.display(), sql);
        let scanned = self.estimator.estimate(&sql);

        let result = self
            .factory
            .open()
            .and_then(|mut engine| engine.execute(&sql, self.engine_threads));
        let seconds = start.elapsed().as_secs_f64();

        match result {
            Ok(rows) => {
                let n = rows.len() as u64;
                eprintln!(
                    "[Compute] {} => rows={}, scanned={}, time={:.4}s",
                    q.path.display(),
                    n,
                    scanned,
                    seconds
                );
                self.logger.query_done(&q.path, n, scanned, seconds);
                QueryOutcome {
                    source: q.path.clone(),
                    rows: n,
                    scanned,
                    seconds,
                    first_row: rows.into_iter().next(),
                    error: None,
                }
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                eprintln!("[Compute] {} failed: {}", q.path.display(), msg);
                self.logger
                    .error("query", &q.path.display().to_string(), &msg);
                QueryOutcome {
                    source: q.path.clone(),
                    rows: 0,
                    scanned,
                    seconds,
                    first_row: None,
                    error: Some(msg),
                }
            }
        }
    }

    /// Download `files`, run `queries` against the local copies, then delete
    /// the copies whether or not the queries succeeded.
    pub fn fetch_and_run(
        &self,
        downloader: &Downloader,
        files: &BTreeSet<String>,
        queries: &[QueryInfo],
    ) -> Result<FetchSummary> {
        let clock = CpuClock::start();
        let download = downloader.download(files)?;
        let totals = self.run_queries(queries, &download.path_map);
        // measured before cleanup: deletion is not part of the run
        let wall = clock.wall();
        let cpu_usage_pct = clock.usage_pct();
        let removed_files = cleanup(&download.path_map);
        let totals = totals?;
        Ok(FetchSummary {
            wall,
            cpu_usage_pct,
            download,
            totals,
            removed_files,
        })
    }
}

/// Delete every local copy in `path_map`; returns how many were removed
pub fn cleanup(path_map: &PathMap) -> usize {
    let mut removed = 0;
    for local in path_map.values() {
        if local.exists() {
            match std::fs::remove_file(local) {
                Ok(()) => removed += 1,
                Err(e) => eprintln!("[Compute] cleanup failed {}: {}", local.display(), e),
            }
        }
    }
    removed
}
