//! Query corpus: loading SQL files, extracting the remote files they scan,
//! and pointing them at local copies.

use anyhow::{Context, Result};
use regex::{Captures, Regex};
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

lazy_static::lazy_static! {
    // parquet_scan('path') / read_parquet("path"), any case, optional spacing
    static ref FILE_SCAN_RE: Regex =
        Regex::new(r#"(?i)(?:parquet_scan|read_parquet)\s*\(\s*['"]([^'"]+)['"]\s*\)"#)
            .expect("file scan pattern is valid");
}

/// remote path -> local path
pub type PathMap = HashMap<String, PathBuf>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryInfo {
    pub path: PathBuf,
    pub sql: String,
    pub needed_files: BTreeSet<String>,
}

impl QueryInfo {
    pub fn new(path: impl Into<PathBuf>, sql: impl Into<String>) -> Self {
        let sql = sql.into();
        let needed_files = parse_parquet_paths(&sql);
        Self {
            path: path.into(),
            sql,
            needed_files,
        }
    }

    /// SQL text with every resolvable remote path replaced by its local copy
    pub fn rewrite(&self, path_map: &PathMap) -> String {
        rewrite_sql(&self.sql, path_map)
    }

    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Every quoted path passed to a file-scan function in `sql`
pub fn parse_parquet_paths(sql: &str) -> BTreeSet<String> {
    FILE_SCAN_RE
        .captures_iter(sql)
        .filter_map(|c| c.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Substitute local paths for remote ones in a single pass over the
/// file-scan calls, so text already substituted is never rescanned. Calls
/// whose path is missing from the map are left untouched.
pub fn rewrite_sql(sql: &str, path_map: &PathMap) -> String {
    FILE_SCAN_RE
        .replace_all(sql, |caps: &Captures| {
            let call = &caps[0];
            let (Some(whole), Some(path)) = (caps.get(0), caps.get(1)) else {
                return call.to_string();
            };
            match path_map.get(path.as_str()) {
                Some(local) => {
                    let start = path.start() - whole.start();
                    let end = path.end() - whole.start();
                    format!("{}{}{}", &call[..start], local.to_string_lossy(), &call[end..])
                }
                None => call.to_string(),
            }
        })
        .into_owned()
}

/// Load `<dir>/<prefix>*<suffix>` in name order and collect the union of the
/// files they need.
pub fn collect_queries(
    dir: &Path,
    prefix: &str,
    suffix: &str,
) -> Result<(BTreeSet<String>, Vec<QueryInfo>)> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .with_context(|| format!("read query dir {}", dir.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(prefix) && n.ends_with(suffix))
        .collect();
    names.sort();

    let mut all_files = BTreeSet::new();
    let mut queries = Vec::with_capacity(names.len());
    for name in names {
        let path = dir.join(&name);
        let sql = std::fs::read_to_string(&path)
            .with_context(|| format!("read query {}", path.display()))?;
        let q = QueryInfo::new(path, sql);
        all_files.extend(q.needed_files.iter().cloned());
        queries.push(q);
    }
    Ok((all_files, queries))
}
