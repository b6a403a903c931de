//! Embedded query engine boundary and scan-row estimation

use anyhow::{Context, Result};
use duckdb::types::TimeUnit;
use std::path::PathBuf;

use crate::envelope::{Row, ScalarValue};

/// An engine that runs one SQL string with a thread-count hint
pub trait QueryEngine: Send {
    fn execute(&mut self, sql: &str, threads: usize) -> Result<Vec<Row>>;
}

/// Opens independent engine instances, one per query or per worker
pub trait EngineFactory: Send + Sync {
    fn open(&self) -> Result<Box<dyn QueryEngine>>;
}

impl<F> EngineFactory for F
where
    F: Fn() -> Result<Box<dyn QueryEngine>> + Send + Sync,
{
    fn open(&self) -> Result<Box<dyn QueryEngine>> {
        self()
    }
}

/// DuckDB connection (in-memory unless a database file is given)
pub struct DuckDbEngine {
    conn: duckdb::Connection,
}

impl DuckDbEngine {
    pub fn in_memory() -> Result<Self> {
        let conn = duckdb::Connection::open_in_memory().context("open in-memory duckdb")?;
        Ok(Self { conn })
    }

    pub fn open(path: Option<&std::path::Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let conn = duckdb::Connection::open(p)
                    .with_context(|| format!("open duckdb database {}", p.display()))?;
                Ok(Self { conn })
            }
            None => Self::in_memory(),
        }
    }
}

impl QueryEngine for DuckDbEngine {
    fn execute(&mut self, sql: &str, threads: usize) -> Result<Vec<Row>> {
        self.conn
            .execute_batch(&format!("SET threads TO {}", threads.max(1)))
            .context("set duckdb threads")?;
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let width = row.as_ref().column_count();
            let mut tuple = Vec::with_capacity(width);
            for i in 0..width {
                let v: duckdb::types::Value = row.get(i)?;
                tuple.push(scalar_from_duckdb(v));
            }
            out.push(tuple);
        }
        Ok(out)
    }
}

fn micros(unit: TimeUnit, v: i64) -> i64 {
    match unit {
        TimeUnit::Second => v.saturating_mul(1_000_000),
        TimeUnit::Millisecond => v.saturating_mul(1_000),
        TimeUnit::Microsecond => v,
        TimeUnit::Nanosecond => v / 1_000,
    }
}

fn scalar_from_duckdb(v: duckdb::types::Value) -> ScalarValue {
    use duckdb::types::Value as V;
    match v {
        V::Null => ScalarValue::Null,
        V::Boolean(b) => ScalarValue::Bool(b),
        V::TinyInt(i) => ScalarValue::Int(i as i64),
        V::SmallInt(i) => ScalarValue::Int(i as i64),
        V::Int(i) => ScalarValue::Int(i as i64),
        V::BigInt(i) => ScalarValue::Int(i),
        V::HugeInt(i) => ScalarValue::HugeInt(i),
        V::UTinyInt(u) => ScalarValue::UInt(u as u64),
        V::USmallInt(u) => ScalarValue::UInt(u as u64),
        V::UInt(u) => ScalarValue::UInt(u as u64),
        V::UBigInt(u) => ScalarValue::UInt(u),
        V::Float(f) => ScalarValue::Float(f as f64),
        V::Double(f) => ScalarValue::Float(f),
        V::Decimal(d) => ScalarValue::Decimal {
            mantissa: d.mantissa(),
            scale: d.scale(),
        },
        V::Date32(days) => ScalarValue::Date(days),
        V::Time64(unit, t) => ScalarValue::Time(micros(unit, t)),
        V::Timestamp(unit, t) => ScalarValue::Timestamp(micros(unit, t)),
        V::Interval {
            months,
            days,
            nanos,
        } => ScalarValue::Interval {
            months,
            days,
            nanos,
        },
        V::Text(s) => ScalarValue::Text(s),
        V::Enum(s) => ScalarValue::Text(s),
        V::Blob(b) => ScalarValue::Bytes(b),
        V::List(items) | V::Array(items) => {
            ScalarValue::List(items.into_iter().map(scalar_from_duckdb).collect())
        }
        V::Struct(fields) => ScalarValue::Struct(
            fields
                .keys()
                .cloned()
                .zip(fields.values().cloned().map(scalar_from_duckdb))
                .collect(),
        ),
        V::Map(entries) => ScalarValue::Map(
            entries
                .keys()
                .cloned()
                .map(scalar_from_duckdb)
                .zip(entries.values().cloned().map(scalar_from_duckdb))
                .collect(),
        ),
        V::Union(inner) => scalar_from_duckdb(*inner),
    }
}

/// Opens a fresh DuckDB connection per call
#[derive(Clone, Debug, Default)]
pub struct DuckDbFactory {
    pub database: Option<PathBuf>,
}

impl EngineFactory for DuckDbFactory {
    fn open(&self) -> Result<Box<dyn QueryEngine>> {
        Ok(Box::new(DuckDbEngine::open(self.database.as_deref())?))
    }
}

/// Guesses how many rows a query scans. Implementations must be cheap and
/// pure; the result is only used for throughput reporting.
pub trait ScanEstimator: Send + Sync {
    fn estimate(&self, sql: &str) -> u64;
}

/// Adds a fixed row count for every known table name that appears
/// (case-insensitively) anywhere in the SQL text. Plain substring matching:
/// `part` also matches `partsupp`.
#[derive(Clone, Debug)]
pub struct TableNameEstimator {
    tables: Vec<(String, u64)>,
}

pub const LINEITEM_ROWS: u64 = 6_001_215;
pub const PART_ROWS: u64 = 200_000;

impl TableNameEstimator {
    pub fn new<S: Into<String>>(tables: impl IntoIterator<Item = (S, u64)>) -> Self {
        Self {
            tables: tables
                .into_iter()
                .map(|(name, rows)| (name.into().to_lowercase(), rows))
                .collect(),
        }
    }

    /// Storage node estimator: lineitem and part
    pub fn storage_default() -> Self {
        Self::new([("lineitem", LINEITEM_ROWS), ("part", PART_ROWS)])
    }

    /// Compute node estimator: lineitem only
    pub fn compute_default() -> Self {
        Self::new([("lineitem", LINEITEM_ROWS)])
    }
}

impl ScanEstimator for TableNameEstimator {
    fn estimate(&self, sql: &str) -> u64 {
        let lower = sql.to_lowercase();
        self.tables
            .iter()
            .filter(|(name, _)| lower.contains(name.as_str()))
            .map(|(_, rows)| *rows)
            .sum()
    }
}
