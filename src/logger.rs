use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

pub trait Logger: Send + Sync {
    fn file_sent(&self, _path: &Path, _bytes: u64, _seconds: f64) {}
    fn file_missing(&self, _requested: &str) {}
    fn file_received(&self, _remote: &str, _local: &Path, _bytes: u64) {}
    fn query_done(&self, _source: &Path, _rows: u64, _scanned: u64, _seconds: f64) {}
    fn error(&self, _context: &str, _subject: &str, _msg: &str) {}
    fn done(&self, _what: &str, _items: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn file_sent(&self, path: &Path, bytes: u64, seconds: f64) {
        self.line(&format!(
            "SENT path={} bytes={} seconds={:.3}",
            path.display(),
            bytes,
            seconds
        ));
    }
    fn file_missing(&self, requested: &str) {
        self.line(&format!("MISSING path={}", requested));
    }
    fn file_received(&self, remote: &str, local: &Path, bytes: u64) {
        self.line(&format!(
            "RECV remote={} local={} bytes={}",
            remote,
            local.display(),
            bytes
        ));
    }
    fn query_done(&self, source: &Path, rows: u64, scanned: u64, seconds: f64) {
        self.line(&format!(
            "QUERY src={} rows={rows} scanned={scanned} seconds={seconds:.4}",
            source.display()
        ));
    }
    fn error(&self, context: &str, subject: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} subject={} msg={}", context, subject, msg));
    }
    fn done(&self, what: &str, items: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE {what} items={items} bytes={bytes} seconds={seconds:.3}"));
    }
}

/// Choose the logger once at startup; NoopLogger keeps hot paths free.
/// A log file that cannot be opened falls back to NoopLogger with a warning.
pub fn from_option(path: Option<&Path>) -> Arc<dyn Logger> {
    match path {
        Some(p) => match TextLogger::new(p) {
            Ok(l) => Arc::new(l),
            Err(e) => {
                eprintln!("warning: cannot open log file {}: {}", p.display(), e);
                Arc::new(NoopLogger)
            }
        },
        None => Arc::new(NoopLogger),
    }
}
