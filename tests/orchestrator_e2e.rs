use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use disagg_bench::downloader::{DownloadConfig, Downloader};
use disagg_bench::engine::{DuckDbFactory, TableNameEstimator, LINEITEM_ROWS};
use disagg_bench::envelope::ScalarValue;
use disagg_bench::orchestrator::Orchestrator;
use disagg_bench::queries::collect_queries;
use disagg_bench::report::{RunMode, RunReport, RunReportEntry};
use disagg_bench::server::StorageServer;
use tempfile::TempDir;

fn start_file_server(root: &Path) -> SocketAddr {
    let server = StorageServer::bind("127.0.0.1:0").unwrap();
    let addr = server.local_addr().unwrap();
    let root = root.to_path_buf();
    thread::spawn(move || {
        let _ = server.serve_files(&root);
    });
    addr
}

/// `<root>/tpch/lineitem/part-0.parquet` with 1000 rows
fn write_lineitem(root: &Path) {
    let dir = root.join("tpch/lineitem");
    std::fs::create_dir_all(&dir).unwrap();
    let conn = duckdb::Connection::open_in_memory().unwrap();
    conn.execute_batch(&format!(
        "COPY (SELECT range AS l_orderkey, range * 1.5 AS l_extendedprice FROM range(1000)) \
         TO '{}' (FORMAT PARQUET)",
        dir.join("part-0.parquet").display()
    ))
    .unwrap();
}

#[test]
fn fetch_then_query_with_duckdb_and_cleanup() {
    let root = TempDir::new().unwrap();
    let queries_dir = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    write_lineitem(root.path());
    std::fs::write(
        queries_dir.path().join("query6_1.sql"),
        "SELECT count(*) FROM parquet_scan('/tpch/lineitem/part-0.parquet') WHERE l_orderkey < 100;\n",
    )
    .unwrap();
    std::fs::write(
        queries_dir.path().join("query6_2.sql"),
        "SELECT max(l_orderkey) FROM read_parquet('/tpch/lineitem/part-0.parquet');\n",
    )
    .unwrap();
    // not matched by the prefix
    std::fs::write(queries_dir.path().join("other.sql"), "SELECT 1").unwrap();

    let (files, queries) = collect_queries(queries_dir.path(), "query6_", ".sql").unwrap();
    assert_eq!(queries.len(), 2);
    assert_eq!(files.len(), 1);

    let addr = start_file_server(root.path());
    let downloader = Downloader::new(DownloadConfig::new(addr.to_string(), scratch.path(), 4));
    let orch = Orchestrator::new(
        Arc::new(DuckDbFactory::default()),
        Arc::new(TableNameEstimator::compute_default()),
        2,
        2,
    );
    let summary = orch.fetch_and_run(&downloader, &files, &queries).unwrap();

    assert_eq!(summary.download.path_map.len(), 1);
    assert_eq!(summary.download.workers, 4);
    assert_eq!(summary.download.shards, 1);
    assert_eq!(summary.totals.executed, 2);
    assert_eq!(summary.totals.failed, 0, "{:?}", summary.totals.outcomes);
    assert_eq!(summary.totals.total_rows, 2);
    assert_eq!(summary.totals.total_scanned, 2 * LINEITEM_ROWS);
    assert_eq!(summary.removed_files, 1);
    // run wall time spans both phases and is taken before the copies are removed
    assert!(summary.wall >= summary.download.elapsed + summary.totals.query_wall);
    assert!(summary.overall_throughput() > 0.0);

    let by_name = |n: &str| {
        summary
            .totals
            .outcomes
            .iter()
            .find(|o| o.source.ends_with(n))
            .unwrap()
            .clone()
    };
    assert_eq!(
        by_name("query6_1.sql").first_row,
        Some(vec![ScalarValue::Int(100)])
    );
    assert_eq!(
        by_name("query6_2.sql").first_row,
        Some(vec![ScalarValue::Int(999)])
    );

    // local copies are gone after the run
    let local = scratch.path().join("lineitem_part-0.parquet");
    assert!(!local.exists());

    let report_path = scratch.path().join("runs.jsonl");
    let report = RunReport::new(&report_path);
    report
        .add_entry(&RunReportEntry::from_fetch(&summary, 2))
        .unwrap();
    let entries = report.read_log().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].mode, RunMode::Fetch);
    assert_eq!(entries[0].files_downloaded, 1);
    assert_eq!(entries[0].queries_executed, 2);
}

#[test]
fn query_on_missing_file_fails_alone() {
    let root = TempDir::new().unwrap();
    let queries_dir = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    write_lineitem(root.path());
    std::fs::write(
        queries_dir.path().join("query6_a.sql"),
        "SELECT count(*) FROM parquet_scan('/tpch/lineitem/part-0.parquet')",
    )
    .unwrap();
    std::fs::write(
        queries_dir.path().join("query6_b.sql"),
        "SELECT count(*) FROM parquet_scan('/tpch/lineitem/absent-0.parquet')",
    )
    .unwrap();

    let (files, queries) = collect_queries(queries_dir.path(), "query6_", ".sql").unwrap();
    assert_eq!(files.len(), 2);

    let addr = start_file_server(root.path());
    let downloader = Downloader::new(DownloadConfig::new(addr.to_string(), scratch.path(), 2));
    let orch = Orchestrator::new(
        Arc::new(DuckDbFactory::default()),
        Arc::new(TableNameEstimator::compute_default()),
        2,
        1,
    );
    let summary = orch.fetch_and_run(&downloader, &files, &queries).unwrap();

    assert_eq!(summary.download.path_map.len(), 1);
    assert!(summary.download.shard_errors.is_empty());
    assert_eq!(summary.totals.executed, 2);
    assert_eq!(summary.totals.failed, 1);
    assert_eq!(summary.totals.total_rows, 1);
    assert_eq!(summary.totals.total_scanned, LINEITEM_ROWS);
    let failed = summary
        .totals
        .outcomes
        .iter()
        .find(|o| o.error.is_some())
        .unwrap();
    assert!(failed.source.ends_with("query6_b.sql"));
    assert_eq!(summary.removed_files, 1);
}
