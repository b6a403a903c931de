//! Framed I/O shared by the storage server and the compute clients
//!
//! Control messages are newline-terminated text tokens read one byte at a
//! time, so nothing past the delimiter is ever consumed from the socket and
//! the bulk payload that follows can be read straight off the same stream.
//! Bulk payloads move through a large fixed buffer.

use anyhow::{anyhow, bail, Context, Result};
use std::io::{ErrorKind, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::protocol::{MAX_TOKEN_LEN, NOT_FOUND};

/// Read one control token: bytes up to (not including) `\n`, or up to EOF.
/// Returns an empty string if the peer closed before sending anything.
pub fn read_token<R: Read + ?Sized>(r: &mut R) -> Result<String> {
    let mut buf = Vec::with_capacity(32);
    let mut byte = [0u8; 1];
    loop {
        match r.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                if buf.len() >= MAX_TOKEN_LEN {
                    bail!("control token exceeds {} bytes", MAX_TOKEN_LEN);
                }
                buf.push(byte[0]);
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("read token"),
        }
    }
    let s = String::from_utf8(buf).context("token is not valid UTF-8")?;
    Ok(s.trim().to_string())
}

/// Write `s` followed by `\n` with a single write so the token can never be
/// split around a following bulk write on the same stream.
pub fn write_token<W: Write + ?Sized>(w: &mut W, s: &str) -> Result<()> {
    let mut line = Vec::with_capacity(s.len() + 1);
    line.extend_from_slice(s.as_bytes());
    line.push(b'\n');
    w.write_all(&line).context("write token")?;
    Ok(())
}

/// Size token as sent by the server: a byte count, or absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeToken {
    Present(u64),
    NotFound,
}

impl SizeToken {
    pub fn encode(&self) -> String {
        match self {
            SizeToken::Present(n) => n.to_string(),
            SizeToken::NotFound => NOT_FOUND.to_string(),
        }
    }
}

/// Parse a size token. An empty token means the peer closed the stream.
pub fn parse_size_token(tok: &str) -> Result<SizeToken> {
    if tok.is_empty() {
        bail!("connection closed before size token");
    }
    let v: i64 = tok
        .parse()
        .map_err(|e| anyhow!("bad size token {:?}: {}", tok, e))?;
    if v < 0 {
        return Ok(SizeToken::NotFound);
    }
    Ok(SizeToken::Present(v as u64))
}

/// Parse the request count token that opens a file-mode connection
pub fn parse_count_token(tok: &str) -> Result<usize> {
    tok.parse::<usize>()
        .map_err(|e| anyhow!("bad count token {:?}: {}", tok, e))
}

/// Move exactly `n` bytes from `src` to `dst` through `buf`.
///
/// A zero-length read before `n` bytes have moved is a short transfer and is
/// returned as an error; the caller decides what that aborts.
pub fn copy_bytes_with<R, W>(src: &mut R, dst: &mut W, n: u64, buf: &mut [u8]) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    if buf.is_empty() {
        bail!("copy buffer must not be empty");
    }
    let mut moved = 0u64;
    while moved < n {
        let want = (n - moved).min(buf.len() as u64) as usize;
        let got = match src.read(&mut buf[..want]) {
            Ok(0) => bail!("short transfer: {}/{} bytes", moved, n),
            Ok(k) => k,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e).context("bulk read"),
        };
        dst.write_all(&buf[..got]).context("bulk write")?;
        moved += got as u64;
    }
    Ok(moved)
}

/// Like [`copy_bytes_with`] but allocates its own buffer of at most
/// `buffer_size` bytes (never more than `n`).
pub fn copy_bytes<R, W>(src: &mut R, dst: &mut W, n: u64, buffer_size: usize) -> Result<u64>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let cap = (buffer_size as u64).min(n.max(1)) as usize;
    let mut buf = vec![0u8; cap.max(1)];
    copy_bytes_with(src, dst, n, &mut buf)
}

/// Resolve a requested path against the serving root.
///
/// Leading `/` and `./` markers are dropped so `/data/a.parquet` and
/// `./data/a.parquet` both land on `<root>/data/a.parquet`. Parent components
/// and NUL bytes are rejected, and an existing target must stay under `root`
/// after symlinks resolve.
pub fn resolve_under_root(root: &Path, requested: &str) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if requested.contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut rel = PathBuf::new();
    for component in Path::new(requested).components() {
        match component {
            CurDir | RootDir => {}
            Normal(s) => rel.push(s),
            ParentDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }

    let joined = root.join(&rel);
    if joined.exists() {
        let canonical = joined
            .canonicalize()
            .map_err(|e| anyhow!("failed to canonicalize {:?}: {}", joined, e))?;
        if !canonical.starts_with(root) {
            bail!("path {:?} escapes root {:?}", requested, root);
        }
        return Ok(canonical);
    }
    Ok(joined)
}
