//! Storage node: file mode and pushdown mode accept loops

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::engine::{QueryEngine, ScanEstimator};
use crate::envelope::ResultEnvelope;
use crate::framing::{
    copy_bytes_with, parse_count_token, read_token, resolve_under_root, write_token, SizeToken,
};
use crate::logger::{Logger, NoopLogger};
use crate::metrics::{mb_per_sec, CpuClock};
use crate::net::{peer_label, tune_socket};
use crate::protocol::{Deadlines, BUFFER_SIZE, MAX_QUERY_BYTES};

/// Per-connection totals for file mode
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FileConnStats {
    pub requested: usize,
    pub sent: usize,
    pub missing: usize,
    pub bytes: u64,
}

pub struct StorageServer {
    listener: TcpListener,
    deadlines: Deadlines,
    buffer_size: usize,
    logger: Arc<dyn Logger>,
}

impl StorageServer {
    pub fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).with_context(|| format!("bind {}", addr))?;
        Ok(Self::from_listener(listener))
    }

    pub fn from_listener(listener: TcpListener) -> Self {
        Self {
            listener,
            deadlines: Deadlines::none(),
            buffer_size: BUFFER_SIZE,
            logger: Arc::new(NoopLogger),
        }
    }

    pub fn with_deadlines(mut self, deadlines: Deadlines) -> Self {
        self.deadlines = deadlines;
        self
    }

    pub fn with_buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes.max(1);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// File mode: one thread per accepted connection. Per-connection faults
    /// are logged and never stop the accept loop.
    pub fn serve_files(self, root: &Path) -> Result<()> {
        let root: Arc<PathBuf> = Arc::new(
            root.canonicalize()
                .with_context(|| format!("canonicalize root {}", root.display()))?,
        );
        eprintln!(
            "[Storage] Listening on {} (file mode) root={}",
            self.local_addr()?,
            root.display()
        );
        for conn in self.listener.incoming() {
            let stream = match conn {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("[Storage] accept error: {}", e);
                    continue;
                }
            };
            let peer = peer_label(&stream);
            eprintln!("[Storage] New connection from {}", peer);
            let root = Arc::clone(&root);
            let logger = Arc::clone(&self.logger);
            let deadlines = self.deadlines;
            let buffer_size = self.buffer_size;
            let spawned = thread::Builder::new()
                .name(format!("storage-{}", peer))
                .spawn(move || {
                    let mut stream = stream;
                    tune_socket(&stream, buffer_size);
                    let result = deadlines.apply(&stream).and_then(|_| {
                        handle_file_conn(&mut stream, &root, buffer_size, logger.as_ref())
                    });
                    match result {
                        Ok(stats) => eprintln!(
                            "[Storage] {} done: {} requested, {} sent, {} missing, {} bytes",
                            peer, stats.requested, stats.sent, stats.missing, stats.bytes
                        ),
                        Err(e) => {
                            eprintln!("[Storage] Error handling {}: {:#}", peer, e);
                            logger.error("file_conn", &peer, &format!("{:#}", e));
                        }
                    }
                });
            if let Err(e) = spawned {
                eprintln!("[Storage] failed to spawn handler: {}", e);
            }
        }
        Ok(())
    }

    /// Pushdown mode: connections are served one at a time from the accept
    /// loop, all against the single engine owned by `service`.
    pub fn serve_pushdown(self, mut service: PushdownService) -> Result<()> {
        eprintln!("[Storage] Listening on {} (pushdown mode)", self.local_addr()?);
        for conn in self.listener.incoming() {
            let mut stream = match conn {
                Ok(s) => s,
                Err(e) => {
                    eprintln!("[Storage] accept error: {}", e);
                    continue;
                }
            };
            let peer = peer_label(&stream);
            eprintln!("[Storage] Connected by {}", peer);
            tune_socket(&stream, self.buffer_size);
            let clock = CpuClock::start();
            let result = self
                .deadlines
                .apply(&stream)
                .and_then(|_| service.handle(&mut stream));
            match result {
                Ok(Some(env)) => {
                    eprintln!(
                        "[Storage] Query executed in {:.4}s, returned rows={}, scanned_rows={}",
                        env.query_time,
                        env.rows.len(),
                        env.scanned_rows
                    );
                    if let Some(err) = &env.error {
                        eprintln!("[Storage] Query failed: {}", err);
                        self.logger.error("pushdown_query", &peer, err);
                    }
                }
                Ok(None) => eprintln!("[Storage] {} closed without a query", peer),
                Err(e) => {
                    eprintln!("[Storage] Error while handling request from {}: {:#}", peer, e);
                    self.logger.error("pushdown_conn", &peer, &format!("{:#}", e));
                }
            }
            drop(stream);
            eprintln!(
                "[Storage] CPU usage for this request: {:.2}% (over ~{:.3}s wall-clock)",
                clock.usage_pct(),
                clock.wall().as_secs_f64()
            );
        }
        Ok(())
    }
}

/// Serve one file-mode connection:
/// count token, then per path a size token and raw bytes (or the sentinel).
pub fn handle_file_conn<S: Read + Write>(
    stream: &mut S,
    root: &Path,
    buffer_size: usize,
    logger: &dyn Logger,
) -> Result<FileConnStats> {
    let count = parse_count_token(&read_token(stream)?)?;
    let mut stats = FileConnStats {
        requested: count,
        ..Default::default()
    };
    let mut buf: Vec<u8> = Vec::new();

    for _ in 0..count {
        let requested = read_token(stream)?;
        let target = if requested.is_empty() {
            None
        } else {
            resolve_under_root(root, &requested)
                .ok()
                .filter(|p| p.is_file())
        };
        let Some(path) = target else {
            write_token(stream, &SizeToken::NotFound.encode())?;
            logger.file_missing(&requested);
            eprintln!("[Storage] File not found: {}", requested);
            stats.missing += 1;
            continue;
        };

        let mut file = File::open(&path).with_context(|| format!("open {}", path.display()))?;
        let size = file.metadata()?.len();
        write_token(stream, &SizeToken::Present(size).encode())?;

        let need = (size.min(buffer_size as u64) as usize).max(1);
        if buf.len() < need {
            buf.resize(need, 0);
        }
        let start = Instant::now();
        let sent = copy_bytes_with(&mut file, stream, size, &mut buf[..need])
            .with_context(|| format!("send {}", path.display()))?;
        let secs = start.elapsed().as_secs_f64();
        match mb_per_sec(sent, secs) {
            Some(speed) => eprintln!(
                "[Storage] Sent {} ({} bytes) in {:.2}s, {:.2} MB/s",
                path.display(),
                sent,
                secs,
                speed
            ),
            None => eprintln!("[Storage] Sent {} ({} bytes)", path.display(), sent),
        }
        logger.file_sent(&path, sent, secs);
        stats.sent += 1;
        stats.bytes += sent;
    }
    stream.flush()?;
    Ok(stats)
}

/// Read a pushdown request body until the client half-closes
pub fn read_request<R: Read>(r: &mut R, max: usize) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    r.take(max as u64 + 1)
        .read_to_end(&mut body)
        .context("read pushdown request")?;
    if body.len() > max {
        anyhow::bail!("pushdown request exceeds {} bytes", max);
    }
    Ok(body)
}

/// Owns the storage-side engine and answers pushdown queries
pub struct PushdownService {
    engine: Box<dyn QueryEngine>,
    estimator: Box<dyn ScanEstimator>,
    threads: usize,
}

impl PushdownService {
    pub fn new(
        engine: Box<dyn QueryEngine>,
        estimator: Box<dyn ScanEstimator>,
        threads: usize,
    ) -> Self {
        Self {
            engine,
            estimator,
            threads: threads.max(1),
        }
    }

    /// Execute one query and wrap the outcome; engine failures become
    /// failure envelopes rather than errors.
    pub fn answer(&mut self, sql: &str) -> ResultEnvelope {
        let scanned = self.estimator.estimate(sql);
        let start = Instant::now();
        let result = self.engine.execute(sql, self.threads);
        let secs = start.elapsed().as_secs_f64();
        match result {
            Ok(rows) => ResultEnvelope::success(rows, scanned, secs),
            Err(e) => ResultEnvelope::failure(format!("{:#}", e), scanned, secs),
        }
    }

    /// Serve one connection. Returns `None` when the client sent nothing.
    pub fn handle<S: Read + Write>(&mut self, stream: &mut S) -> Result<Option<ResultEnvelope>> {
        let body = read_request(stream, MAX_QUERY_BYTES)?;
        if body.is_empty() {
            return Ok(None);
        }
        let env = match std::str::from_utf8(&body) {
            Ok(text) => {
                let sql = text.trim();
                eprintln!("[Storage] Received query:\n  {}", sql);
                self.answer(sql)
            }
            Err(e) => ResultEnvelope::failure(format!("request is not valid UTF-8: {}", e), 0, 0.0),
        };
        let payload = env.encode()?;
        stream.write_all(&payload).context("write envelope")?;
        stream.flush()?;
        eprintln!("[Storage] Sent {} bytes back to compute.", payload.len());
        Ok(Some(env))
    }
}
