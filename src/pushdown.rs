//! Remote query executor: pushes SQL to the storage node, one connection per
//! query, and aggregates what comes back.

use anyhow::{anyhow, Context, Result};
use std::io::{Read, Write};
use std::net::Shutdown;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use crate::envelope::{ResultEnvelope, Row};
use crate::logger::{Logger, NoopLogger};
use crate::metrics::{rows_per_sec, CpuClock};
use crate::net::connect;
use crate::protocol::{Deadlines, BUFFER_SIZE, MAX_ENVELOPE_BYTES};
use crate::queries::QueryInfo;

/// One pushdown round trip as seen by the client
#[derive(Clone, Debug, PartialEq)]
pub struct PushdownResult {
    pub rows: Vec<Row>,
    pub scanned_rows: u64,
    /// Connect + send + server work + receive, in seconds
    pub transfer_time: f64,
    pub response_bytes: u64,
    pub server_query_time: f64,
}

/// Send `sql`, half-close, and read the envelope until the server closes
pub fn send_query(addr: &str, sql: &str, deadlines: &Deadlines) -> Result<PushdownResult> {
    let start = Instant::now();
    let mut stream = connect(addr, deadlines, BUFFER_SIZE)?;
    stream.write_all(sql.as_bytes()).context("send query")?;
    stream.flush()?;
    stream.shutdown(Shutdown::Write).context("half-close request")?;

    let mut received = Vec::new();
    (&mut stream)
        .take(MAX_ENVELOPE_BYTES)
        .read_to_end(&mut received)
        .context("receive envelope")?;
    let transfer_time = start.elapsed().as_secs_f64();

    let env = ResultEnvelope::decode(&received)?;
    if let Some(err) = env.error {
        return Err(anyhow!("storage engine error: {}", err));
    }
    Ok(PushdownResult {
        rows: env.rows,
        scanned_rows: env.scanned_rows,
        transfer_time,
        response_bytes: received.len() as u64,
        server_query_time: env.query_time,
    })
}

#[derive(Clone, Debug, PartialEq)]
pub struct PushdownOutcome {
    pub source: PathBuf,
    pub rows: u64,
    pub scanned: u64,
    pub transfer_time: f64,
    pub response_bytes: u64,
    pub server_query_time: f64,
    pub cpu_usage_pct: f64,
    pub first_row: Option<Row>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct PushdownSummary {
    pub executed: usize,
    pub failed: usize,
    pub total_rows: u64,
    pub total_scanned: u64,
    pub total_transfer_time: f64,
    pub total_response_bytes: u64,
    pub total_server_time: f64,
    pub wall_seconds: f64,
    pub cpu_usage_pct: f64,
    pub outcomes: Vec<PushdownOutcome>,
}

impl PushdownSummary {
    pub fn throughput(&self) -> f64 {
        rows_per_sec(self.total_scanned, self.wall_seconds)
    }
}

pub struct PushdownClient {
    addr: String,
    deadlines: Deadlines,
    logger: Arc<dyn Logger>,
}

impl PushdownClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            deadlines: Deadlines::none(),
            logger: Arc::new(NoopLogger),
        }
    }

    pub fn with_deadlines(mut self, deadlines: Deadlines) -> Self {
        self.deadlines = deadlines;
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    /// Run queries one after another; the pushdown server answers one
    /// connection at a time, so there is nothing to gain from fanning out.
    pub fn run(&self, queries: &[QueryInfo]) -> PushdownSummary {
        let overall = CpuClock::start();
        let mut summary = PushdownSummary::default();
        for q in queries {
            eprintln!("\n[Compute] ===== Executing {} =====", q.name());
            let clock = CpuClock::start();
            let result = send_query(&self.addr, q.sql.trim(), &self.deadlines);
            let cpu_usage_pct = clock.usage_pct();
            let outcome = match result {
                Ok(r) => {
                    eprintln!(
                        "[Compute] {} => Returned {} rows, scanned={}, data_time={:.4}s, data_size={}, server_time={:.4}s",
                        q.name(),
                        r.rows.len(),
                        r.scanned_rows,
                        r.transfer_time,
                        r.response_bytes,
                        r.server_query_time
                    );
                    if let Some(first) = r.rows.first() {
                        eprintln!("[Compute] Sample first row: {:?}", first);
                    }
                    self.logger.query_done(
                        &q.path,
                        r.rows.len() as u64,
                        r.scanned_rows,
                        r.transfer_time,
                    );
                    PushdownOutcome {
                        source: q.path.clone(),
                        rows: r.rows.len() as u64,
                        scanned: r.scanned_rows,
                        transfer_time: r.transfer_time,
                        response_bytes: r.response_bytes,
                        server_query_time: r.server_query_time,
                        cpu_usage_pct,
                        first_row: r.rows.into_iter().next(),
                        error: None,
                    }
                }
                Err(e) => {
                    let msg = format!("{:#}", e);
                    eprintln!("[Compute] {} failed: {}", q.name(), msg);
                    self.logger.error("pushdown", &q.name(), &msg);
                    PushdownOutcome {
                        source: q.path.clone(),
                        rows: 0,
                        scanned: 0,
                        transfer_time: 0.0,
                        response_bytes: 0,
                        server_query_time: 0.0,
                        cpu_usage_pct,
                        first_row: None,
                        error: Some(msg),
                    }
                }
            };
            summary.executed += 1;
            if outcome.error.is_some() {
                summary.failed += 1;
            }
            summary.total_rows += outcome.rows;
            summary.total_scanned += outcome.scanned;
            summary.total_transfer_time += outcome.transfer_time;
            summary.total_response_bytes += outcome.response_bytes;
            summary.total_server_time += outcome.server_query_time;
            summary.outcomes.push(outcome);
        }
        summary.wall_seconds = overall.wall().as_secs_f64();
        summary.cpu_usage_pct = overall.usage_pct();
        summary
    }
}
