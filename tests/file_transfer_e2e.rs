use std::collections::BTreeSet;
use std::io::Read;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::thread;

use disagg_bench::downloader::{DownloadConfig, Downloader};
use disagg_bench::framing::{parse_size_token, read_token, write_token, SizeToken};
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

fn write_file(root: &Path, rel: &str, data: &[u8]) {
    let p = root.join(rel);
    std::fs::create_dir_all(p.parent().unwrap()).unwrap();
    std::fs::write(p, data).unwrap();
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

#[test]
fn present_and_missing_files_over_two_workers() {
    let root = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let data = pattern(100);
    write_file(root.path(), "tpch/lineitem/a.parquet", &data);
    let addr = start_file_server(root.path());

    let files: BTreeSet<String> = [
        "/tpch/lineitem/a.parquet".to_string(),
        "/tpch/lineitem/missing.parquet".to_string(),
    ]
    .into_iter()
    .collect();
    let dl = Downloader::new(DownloadConfig::new(addr.to_string(), scratch.path(), 2));
    let report = dl.download(&files).unwrap();

    assert_eq!(report.workers, 2);
    assert_eq!(report.shards, 2);
    assert!(report.shard_errors.is_empty());
    assert_eq!(report.records.len(), 2);
    assert_eq!(report.path_map.len(), 1);
    assert_eq!(report.total_bytes, 100);

    let local = &report.path_map["/tpch/lineitem/a.parquet"];
    assert_eq!(local, &scratch.path().join("lineitem_a.parquet"));
    assert_eq!(std::fs::read(local).unwrap(), data);
    assert!(!report.path_map.contains_key("/tpch/lineitem/missing.parquet"));
}

#[test]
fn single_worker_missing_sibling_does_not_abort() {
    let root = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    write_file(root.path(), "data/a.parquet", &pattern(100));
    let addr = start_file_server(root.path());

    let files: BTreeSet<String> = ["/data/missing.parquet", "/data/a.parquet"]
        .into_iter()
        .map(String::from)
        .collect();
    let dl = Downloader::new(DownloadConfig::new(addr.to_string(), scratch.path(), 1));
    let report = dl.download(&files).unwrap();

    assert_eq!(report.shards, 1);
    assert!(report.shard_errors.is_empty());
    assert_eq!(report.path_map.len(), 1);
    let local = &report.path_map["/data/a.parquet"];
    assert_eq!(std::fs::metadata(local).unwrap().len(), 100);
}

#[test]
fn raw_session_sizes_sentinels_and_escapes() {
    let root = TempDir::new().unwrap();
    write_file(root.path(), "d/x.bin", &pattern(100));
    let addr = start_file_server(root.path());

    let mut s = TcpStream::connect(addr).unwrap();
    write_token(&mut s, "4").unwrap();

    write_token(&mut s, "/d/x.bin").unwrap();
    let size = parse_size_token(&read_token(&mut s).unwrap()).unwrap();
    assert_eq!(size, SizeToken::Present(100));
    let mut body = vec![0u8; 100];
    s.read_exact(&mut body).unwrap();
    assert_eq!(body, pattern(100));

    write_token(&mut s, "").unwrap();
    assert_eq!(read_token(&mut s).unwrap(), "-1");

    write_token(&mut s, "/d/../../etc/passwd").unwrap();
    assert_eq!(read_token(&mut s).unwrap(), "-1");

    // directories are not files
    write_token(&mut s, "d").unwrap();
    assert_eq!(read_token(&mut s).unwrap(), "-1");

    // server closes after the announced count
    let mut rest = Vec::new();
    s.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}

#[test]
fn bad_count_drops_connection_but_server_keeps_serving() {
    let root = TempDir::new().unwrap();
    write_file(root.path(), "d/y.bin", b"hello");
    let addr = start_file_server(root.path());

    let mut bad = TcpStream::connect(addr).unwrap();
    write_token(&mut bad, "not-a-number").unwrap();
    let mut rest = Vec::new();
    let _ = bad.read_to_end(&mut rest);
    assert!(rest.is_empty());

    let mut good = TcpStream::connect(addr).unwrap();
    write_token(&mut good, "1").unwrap();
    write_token(&mut good, "d/y.bin").unwrap();
    assert_eq!(read_token(&mut good).unwrap(), "5");
    let mut body = [0u8; 5];
    good.read_exact(&mut body).unwrap();
    assert_eq!(&body, b"hello");
}

#[test]
fn many_files_across_many_workers() {
    let root = TempDir::new().unwrap();
    let scratch = TempDir::new().unwrap();
    let mut files = BTreeSet::new();
    for i in 0..10 {
        let rel = format!("ds{}/part-{}.parquet", i % 3, i);
        write_file(root.path(), &rel, &pattern(1000 + i * 4096));
        files.insert(format!("/{}", rel));
    }
    let addr = start_file_server(root.path());

    let dl = Downloader::new(DownloadConfig::new(addr.to_string(), scratch.path(), 4));
    let report = dl.download(&files).unwrap();
    assert_eq!(report.shards, 4);
    assert_eq!(report.path_map.len(), 10);
    let expected: u64 = (0..10).map(|i| 1000 + i as u64 * 4096).sum();
    assert_eq!(report.total_bytes, expected);
    for i in 0..10 {
        let remote = format!("/ds{}/part-{}.parquet", i % 3, i);
        let local = &report.path_map[&remote];
        assert_eq!(std::fs::read(local).unwrap(), pattern(1000 + i * 4096));
    }
}

#[test]
fn concurrent_clients_are_served_independently() {
    let root = TempDir::new().unwrap();
    let big = pattern(3 * 1024 * 1024 + 17);
    write_file(root.path(), "big/blob.parquet", &big);
    let addr = start_file_server(root.path());

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let big = big.clone();
            thread::spawn(move || {
                let scratch = TempDir::new().unwrap();
                let files: BTreeSet<String> = ["/big/blob.parquet".to_string()].into_iter().collect();
                let dl = Downloader::new(DownloadConfig::new(addr.to_string(), scratch.path(), 1));
                let report = dl.download(&files).unwrap();
                let local = &report.path_map["/big/blob.parquet"];
                assert_eq!(std::fs::read(local).unwrap(), big);
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn unreachable_storage_reports_shard_error() {
    // bind then drop to get a port nothing listens on
    let addr = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap()
    };
    let scratch = TempDir::new().unwrap();
    let files: BTreeSet<String> = ["/a/b.parquet".to_string()].into_iter().collect();
    let dl = Downloader::new(DownloadConfig::new(addr.to_string(), scratch.path(), 1));
    let report = dl.download(&files).unwrap();
    assert!(report.path_map.is_empty());
    assert_eq!(report.shard_errors.len(), 1);
}
