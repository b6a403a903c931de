//! Shared protocol constants for the storage/compute wire formats

use std::net::TcpStream;
use std::time::Duration;

use anyhow::{Context, Result};

/// Storage server listens on all interfaces by default
pub const DEFAULT_BIND: &str = "0.0.0.0:9000";

/// Default address the compute side dials
pub const DEFAULT_STORAGE_ADDR: &str = "127.0.0.1:9000";

/// Bulk copy buffer (16MB) - also used for SO_SNDBUF/SO_RCVBUF
pub const BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Byte-length token sent in place of a size when the file is absent
pub const NOT_FOUND: &str = "-1";

/// Upper bound on download workers (and therefore connections per batch)
pub const MAX_WORKERS: usize = 16;

// Maximum control token length (64KB) - prevents memory exhaustion from a
// peer that never sends a newline
pub const MAX_TOKEN_LEN: usize = 64 * 1024;

// Maximum pushdown request body (SQL text)
pub const MAX_QUERY_BYTES: usize = 4 * 1024 * 1024;

// Maximum pushdown response body (serialized envelope)
pub const MAX_ENVELOPE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Result envelope header constants
pub mod envelope {
    pub const MAGIC: &[u8; 4] = b"QENV";
    pub const VERSION: u16 = 1;
    /// MAGIC (4) | VERSION (2)
    pub const HEADER_LEN: usize = 6;
}

/// Socket deadlines. `None` means block forever, which is the default for
/// every operation; tests and operators opt in to bounded waits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Deadlines {
    pub connect: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
}

impl Deadlines {
    pub fn none() -> Self {
        Self::default()
    }

    /// Build from millisecond knobs where 0 means "no deadline"
    pub fn from_millis(connect_ms: u64, read_ms: u64, write_ms: u64) -> Self {
        let opt = |ms: u64| (ms > 0).then(|| Duration::from_millis(ms));
        Self {
            connect: opt(connect_ms),
            read: opt(read_ms),
            write: opt(write_ms),
        }
    }

    /// Same deadline for connect, read and write
    pub fn uniform(d: Duration) -> Self {
        Self {
            connect: Some(d),
            read: Some(d),
            write: Some(d),
        }
    }

    /// Install read/write timeouts on an accepted or connected stream
    pub fn apply(&self, stream: &TcpStream) -> Result<()> {
        stream
            .set_read_timeout(self.read)
            .context("set read timeout")?;
        stream
            .set_write_timeout(self.write)
            .context("set write timeout")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn zero_millis_means_no_deadline() {
        let d = Deadlines::from_millis(0, 250, 0);
        assert_eq!(d.connect, None);
        assert_eq!(d.read, Some(Duration::from_millis(250)));
        assert_eq!(d.write, None);
        assert_eq!(Deadlines::from_millis(0, 0, 0), Deadlines::none());
    }

    #[test]
    fn apply_sets_stream_timeouts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let d = Deadlines::uniform(Duration::from_millis(150));
        d.apply(&client).unwrap();
        assert_eq!(client.read_timeout().unwrap(), Some(Duration::from_millis(150)));
        assert_eq!(client.write_timeout().unwrap(), Some(Duration::from_millis(150)));

        Deadlines::none().apply(&client).unwrap();
        assert_eq!(client.read_timeout().unwrap(), None);
    }
}
