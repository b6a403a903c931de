//! Batch downloader: shards a file set across workers, one connection each

use anyhow::{Context, Result};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use crate::framing::{copy_bytes_with, parse_size_token, read_token, write_token, SizeToken};
use crate::logger::{Logger, NoopLogger};
use crate::net::connect;
use crate::progress::TransferProgress;
use crate::protocol::{Deadlines, BUFFER_SIZE, MAX_WORKERS};
use crate::queries::PathMap;

/// Outcome of one requested file. `local_path` is `None` when the server
/// reported the file missing or the transfer failed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileTransferRecord {
    pub remote_path: String,
    pub local_path: Option<PathBuf>,
    pub bytes: u64,
}

impl FileTransferRecord {
    fn missing(remote: &str) -> Self {
        Self {
            remote_path: remote.to_string(),
            local_path: None,
            bytes: 0,
        }
    }
}

/// Everything one worker produced. Records stop at the first transport
/// failure; `error` says why.
#[derive(Debug, Default)]
pub struct ShardOutcome {
    pub shard: usize,
    pub records: Vec<FileTransferRecord>,
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct DownloadReport {
    pub path_map: PathMap,
    /// All records in completion order across shards
    pub records: Vec<FileTransferRecord>,
    pub shard_errors: Vec<String>,
    pub total_bytes: u64,
    pub elapsed: Duration,
    pub workers: usize,
    pub shards: usize,
}

#[derive(Clone, Debug)]
pub struct DownloadConfig {
    pub addr: String,
    pub scratch_dir: PathBuf,
    pub workers: usize,
    pub buffer_size: usize,
    pub deadlines: Deadlines,
}

impl DownloadConfig {
    pub fn new(addr: impl Into<String>, scratch_dir: impl Into<PathBuf>, workers: usize) -> Self {
        Self {
            addr: addr.into(),
            scratch_dir: scratch_dir.into(),
            workers,
            buffer_size: BUFFER_SIZE,
            deadlines: Deadlines::none(),
        }
    }
}

/// Worker count used for a batch: at least 1, at most MAX_WORKERS
pub fn clamp_workers(requested: usize) -> usize {
    requested.clamp(1, MAX_WORKERS)
}

/// Split `files` into contiguous shards of `ceil(len / workers)` entries.
/// May yield fewer than `workers` shards; never yields an empty one.
pub fn partition<T: Clone>(files: &[T], workers: usize) -> Vec<Vec<T>> {
    if files.is_empty() {
        return Vec::new();
    }
    let workers = clamp_workers(workers);
    let chunk = files.len().div_ceil(workers);
    files.chunks(chunk).map(|c| c.to_vec()).collect()
}

/// Scratch file name from the last two path segments:
/// `/tpch/lineitem/a.parquet` -> `lineitem_a.parquet`. A path without `/`
/// uses `data` as the dataset id.
pub fn local_file_name(remote: &str) -> String {
    let parts: Vec<&str> = remote.split('/').collect();
    let base = parts.last().copied().unwrap_or(remote);
    let dataset = if parts.len() >= 2 {
        parts[parts.len() - 2]
    } else {
        "data"
    };
    format!("{}_{}", dataset, base)
}

/// Assign every remote path a scratch name, suffixing `.1`, `.2`, ... when
/// two paths would otherwise land on the same file.
pub fn assign_local_names(files: &[String]) -> HashMap<String, String> {
    let mut taken: HashSet<String> = HashSet::new();
    let mut names = HashMap::with_capacity(files.len());
    for remote in files {
        let base = local_file_name(remote);
        let mut candidate = base.clone();
        let mut n = 1;
        while !taken.insert(candidate.clone()) {
            candidate = format!("{}.{}", base, n);
            n += 1;
        }
        names.insert(remote.clone(), candidate);
    }
    names
}

pub struct Downloader {
    cfg: DownloadConfig,
    logger: Arc<dyn Logger>,
    progress: TransferProgress,
}

impl Downloader {
    pub fn new(cfg: DownloadConfig) -> Self {
        Self {
            cfg,
            logger: Arc::new(NoopLogger),
            progress: TransferProgress::hidden(),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_progress(mut self, progress: TransferProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Fetch every file in `files`, blocking until all workers finish.
    pub fn download(&self, files: &BTreeSet<String>) -> Result<DownloadReport> {
        let mut report = DownloadReport::default();
        if files.is_empty() {
            return Ok(report);
        }

        let workers = clamp_workers(self.cfg.workers);
        let file_list: Vec<String> = files.iter().cloned().collect();
        let names = assign_local_names(&file_list);
        let shards = partition(&file_list, workers);
        eprintln!(
            "[Compute] All files: {}. Split into {} chunks for {} thread(s).",
            file_list.len(),
            shards.len(),
            workers
        );
        std::fs::create_dir_all(&self.cfg.scratch_dir)
            .with_context(|| format!("create scratch dir {}", self.cfg.scratch_dir.display()))?;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("download-{}", i))
            .build()
            .context("build download pool")?;

        let start = Instant::now();
        let (tx, rx) = mpsc::channel::<ShardOutcome>();
        pool.scope(|s| {
            for (idx, shard) in shards.iter().enumerate() {
                let tx = tx.clone();
                let names = &names;
                s.spawn(move |_| {
                    let _ = tx.send(self.fetch_shard(idx, shard, names));
                });
            }
        });
        drop(tx);

        for outcome in rx {
            if let Some(err) = outcome.error {
                eprintln!("[Compute] Error in shard {}: {}", outcome.shard, err);
                report.shard_errors.push(err);
            }
            for rec in outcome.records {
                if let Some(local) = &rec.local_path {
                    report.path_map.insert(rec.remote_path.clone(), local.clone());
                    report.total_bytes += rec.bytes;
                }
                report.records.push(rec);
            }
        }
        report.elapsed = start.elapsed();
        report.workers = workers;
        report.shards = shards.len();
        self.logger.done(
            "download",
            report.path_map.len() as u64,
            report.total_bytes,
            report.elapsed.as_secs_f64(),
        );
        Ok(report)
    }

    fn fetch_shard(&self, idx: usize, shard: &[String], names: &HashMap<String, String>) -> ShardOutcome {
        let mut stream = match connect(&self.cfg.addr, &self.cfg.deadlines, self.cfg.buffer_size) {
            Ok(s) => s,
            Err(e) => {
                self.logger.error("connect", &self.cfg.addr, &format!("{:#}", e));
                return ShardOutcome {
                    shard: idx,
                    records: Vec::new(),
                    error: Some(format!("{:#}", e)),
                };
            }
        };
        let mut outcome = fetch_shard_over(
            &mut stream,
            shard,
            names,
            &self.cfg.scratch_dir,
            self.cfg.buffer_size,
            self.logger.as_ref(),
            &self.progress,
        );
        outcome.shard = idx;
        outcome
    }
}

/// Run the file-mode client sequence for one shard over an open stream
pub fn fetch_shard_over<S: Read + Write>(
    stream: &mut S,
    shard: &[String],
    names: &HashMap<String, String>,
    scratch_dir: &Path,
    buffer_size: usize,
    logger: &dyn Logger,
    progress: &TransferProgress,
) -> ShardOutcome {
    let mut outcome = ShardOutcome::default();
    if shard.is_empty() {
        return outcome;
    }
    if let Err(e) = write_token(stream, &shard.len().to_string()) {
        outcome.error = Some(format!("{:#}", e));
        return outcome;
    }

    let mut buf: Vec<u8> = Vec::new();
    for remote in shard {
        let local_name = names
            .get(remote)
            .cloned()
            .unwrap_or_else(|| local_file_name(remote));
        let local = scratch_dir.join(local_name);
        match fetch_one(stream, remote, &local, buffer_size, &mut buf) {
            Ok(rec) => {
                match &rec.local_path {
                    Some(p) => {
                        eprintln!("[Compute] Received => {}, size={} bytes", p.display(), rec.bytes);
                        logger.file_received(remote, p, rec.bytes);
                    }
                    None => {
                        eprintln!("[Compute] Storage says file not found: {}", remote);
                        logger.file_missing(remote);
                    }
                }
                progress.file_done(rec.bytes);
                outcome.records.push(rec);
            }
            Err(e) => {
                let msg = format!("{}: {:#}", remote, e);
                logger.error("fetch", remote, &format!("{:#}", e));
                progress.file_done(0);
                outcome.records.push(FileTransferRecord::missing(remote));
                outcome.error = Some(msg);
                break;
            }
        }
    }
    outcome
}

/// Request one path and receive it into `local`. A missing file is `Ok`
/// with no local path; transport or short-transfer failures are `Err` and
/// leave no partial file behind.
fn fetch_one<S: Read + Write>(
    stream: &mut S,
    remote: &str,
    local: &Path,
    buffer_size: usize,
    buf: &mut Vec<u8>,
) -> Result<FileTransferRecord> {
    write_token(stream, remote)?;
    let size = match parse_size_token(&read_token(stream)?)? {
        SizeToken::NotFound => return Ok(FileTransferRecord::missing(remote)),
        SizeToken::Present(n) => n,
    };

    let need = (size.min(buffer_size as u64) as usize).max(1);
    if buf.len() < need {
        buf.resize(need, 0);
    }
    let result: Result<u64> = (|| {
        let file = File::create(local).with_context(|| format!("create {}", local.display()))?;
        let mut writer = BufWriter::with_capacity(need, file);
        let got = copy_bytes_with(stream, &mut writer, size, &mut buf[..need])?;
        writer.flush()?;
        Ok(got)
    })();

    match result {
        Ok(bytes) => Ok(FileTransferRecord {
            remote_path: remote.to_string(),
            local_path: Some(local.to_path_buf()),
            bytes,
        }),
        Err(e) => {
            let _ = std::fs::remove_file(local);
            Err(e)
        }
    }
}
