//! Pushdown result envelope
//!
//! One envelope answers one pushdown query. On the wire it is
//! `MAGIC (4) | VERSION (2, LE) | bincode(ResultEnvelope)`; the header lets a
//! client tell a truncated or foreign response apart from an engine error.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::protocol::envelope::{HEADER_LEN, MAGIC, VERSION};

/// A single typed result cell
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    HugeInt(i128),
    Float(f64),
    /// Exact decimal: `mantissa / 10^scale`
    Decimal { mantissa: i128, scale: u32 },
    /// Days since 1970-01-01
    Date(i32),
    /// Microseconds since midnight
    Time(i64),
    /// Microseconds since the Unix epoch
    Timestamp(i64),
    Interval { months: i32, days: i32, nanos: i64 },
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<ScalarValue>),
    Struct(Vec<(String, ScalarValue)>),
    Map(Vec<(ScalarValue, ScalarValue)>),
}

pub type Row = Vec<ScalarValue>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub rows: Vec<Row>,
    /// Static estimate from the server's scan estimator, not a real counter
    pub scanned_rows: u64,
    /// Server-side execution time in seconds
    pub query_time: f64,
    /// Engine failure text; `rows` is empty when set
    pub error: Option<String>,
}

impl ResultEnvelope {
    pub fn success(rows: Vec<Row>, scanned_rows: u64, query_time: f64) -> Self {
        Self {
            rows,
            scanned_rows,
            query_time,
            error: None,
        }
    }

    pub fn failure(msg: impl Into<String>, scanned_rows: u64, query_time: f64) -> Self {
        Self {
            rows: Vec::new(),
            scanned_rows,
            query_time,
            error: Some(msg.into()),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = bincode::serialize(self).context("serialize result envelope")?;
        let mut out = Vec::with_capacity(HEADER_LEN + body.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            bail!("empty envelope (server closed without a response)");
        }
        if bytes.len() < HEADER_LEN {
            bail!("truncated envelope header: {} bytes", bytes.len());
        }
        if &bytes[0..4] != MAGIC {
            bail!("invalid magic in envelope header");
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != VERSION {
            bail!("envelope version mismatch: got {}, expected {}", version, VERSION);
        }
        bincode::deserialize(&bytes[HEADER_LEN..]).context("deserialize result envelope")
    }
}
