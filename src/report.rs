use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::metrics::mb_per_sec;
use crate::orchestrator::FetchSummary;
use crate::pushdown::PushdownSummary;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Fetch,
    Pushdown,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RunReportEntry {
    pub timestamp: String,
    pub run_id: String,
    pub mode: RunMode,
    pub download_threads: usize,
    pub query_threads: usize,
    pub files_downloaded: usize,
    pub total_bytes: u64,
    pub download_seconds: f64,
    pub download_mb_per_sec: Option<f64>,
    pub queries_executed: usize,
    pub queries_failed: usize,
    pub total_rows: u64,
    pub total_scanned: u64,
    pub query_seconds: f64,
    pub wall_seconds: f64,
    pub throughput_rows_per_sec: f64,
    pub cpu_usage_pct: f64,
}

impl RunReportEntry {
    fn stamp(mode: RunMode) -> (String, String, RunMode) {
        (
            Utc::now().to_rfc3339(),
            uuid::Uuid::new_v4().to_string(),
            mode,
        )
    }

    pub fn from_fetch(s: &FetchSummary, query_threads: usize) -> Self {
        let (timestamp, run_id, mode) = Self::stamp(RunMode::Fetch);
        let download_seconds = s.download.elapsed.as_secs_f64();
        Self {
            timestamp,
            run_id,
            mode,
            download_threads: s.download.workers,
            query_threads,
            files_downloaded: s.download.path_map.len(),
            total_bytes: s.download.total_bytes,
            download_seconds,
            download_mb_per_sec: mb_per_sec(s.download.total_bytes, download_seconds),
            queries_executed: s.totals.executed,
            queries_failed: s.totals.failed,
            total_rows: s.totals.total_rows,
            total_scanned: s.totals.total_scanned,
            query_seconds: s.totals.query_wall.as_secs_f64(),
            wall_seconds: s.wall.as_secs_f64(),
            throughput_rows_per_sec: s.overall_throughput(),
            cpu_usage_pct: s.cpu_usage_pct,
        }
    }

    pub fn from_pushdown(s: &PushdownSummary) -> Self {
        let (timestamp, run_id, mode) = Self::stamp(RunMode::Pushdown);
        Self {
            timestamp,
            run_id,
            mode,
            download_threads: 0,
            query_threads: 1,
            files_downloaded: 0,
            total_bytes: s.total_response_bytes,
            download_seconds: s.total_transfer_time,
            download_mb_per_sec: mb_per_sec(s.total_response_bytes, s.total_transfer_time),
            queries_executed: s.executed,
            queries_failed: s.failed,
            total_rows: s.total_rows,
            total_scanned: s.total_scanned,
            query_seconds: s.total_server_time,
            wall_seconds: s.wall_seconds,
            throughput_rows_per_sec: s.throughput(),
            cpu_usage_pct: s.cpu_usage_pct,
        }
    }
}

pub struct RunReport {
    log_file_path: PathBuf,
}

impl RunReport {
    pub fn new(path: &Path) -> Self {
        RunReport {
            log_file_path: path.to_path_buf(),
        }
    }

    pub fn add_entry(&self, entry: &RunReportEntry) -> Result<()> {
        if let Some(parent) = self.log_file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).ok();
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .with_context(|| format!("open run report {} for append", self.log_file_path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, entry).context("encode run entry")?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_log(&self) -> Result<Vec<RunReportEntry>> {
        if !self.log_file_path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.log_file_path)
            .with_context(|| format!("open run report {}", self.log_file_path.display()))?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for (n, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: RunReportEntry = serde_json::from_str(&line)
                .with_context(|| format!("run report line {} is not a run entry", n + 1))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn entries_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let report = RunReport::new(&dir.path().join("reports/runs.jsonl"));
        assert!(report.read_log().unwrap().is_empty());

        let mut fetch = FetchSummary::default();
        fetch.download.workers = 4;
        fetch.download.total_bytes = 2 * 1_048_576;
        fetch.download.elapsed = Duration::from_secs(1);
        fetch.totals.executed = 3;
        fetch.totals.total_scanned = 600;
        fetch.wall = Duration::from_secs(2);
        let a = RunReportEntry::from_fetch(&fetch, 4);
        assert_eq!(a.download_mb_per_sec, Some(2.0));
        assert_eq!(a.throughput_rows_per_sec, 300.0);

        let mut push = PushdownSummary::default();
        push.executed = 10;
        push.failed = 1;
        let b = RunReportEntry::from_pushdown(&push);

        report.add_entry(&a).unwrap();
        report.add_entry(&b).unwrap();
        let back = report.read_log().unwrap();
        assert_eq!(back, vec![a.clone(), b.clone()]);
        assert_eq!(back[0].mode, RunMode::Fetch);
        assert_eq!(back[1].mode, RunMode::Pushdown);
        assert_ne!(back[0].run_id, back[1].run_id);
    }

    #[test]
    fn foreign_line_is_reported_by_number() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("runs.jsonl");
        let report = RunReport::new(&path);
        report
            .add_entry(&RunReportEntry::from_pushdown(&PushdownSummary::default()))
            .unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{\"not\": \"a run\"}\n")
            .unwrap();
        let err = report.read_log().unwrap_err();
        assert!(format!("{:#}", err).contains("line 2"), "{:#}", err);
    }
}
