use anyhow::{Context, Result};
use clap::Parser;

use disagg_bench::cli::{ServeMode, StorageOpts};
use disagg_bench::engine::{DuckDbEngine, TableNameEstimator};
use disagg_bench::logger;
use disagg_bench::server::{PushdownService, StorageServer};

fn main() -> Result<()> {
    let opts = StorageOpts::parse();

    if !opts.root.exists() {
        anyhow::bail!("Error: Root directory does not exist: {}", opts.root.display());
    }
    if !opts.root.is_dir() {
        anyhow::bail!("Error: Root path is not a directory: {}", opts.root.display());
    }
    let canonical_root = std::fs::canonicalize(&opts.root)
        .with_context(|| format!("Failed to canonicalize root path: {}", opts.root.display()))?;

    println!("Starting storage node:");
    println!("  Root: {}", canonical_root.display());
    println!("  Bind: {}", opts.bind);
    println!("  Mode: {:?}", opts.mode);

    if opts.bind.starts_with("0.0.0.0") {
        eprintln!("WARNING: Binding to 0.0.0.0 exposes the storage node to all interfaces");
        eprintln!("   The protocol is unencrypted and unauthenticated; use trusted networks only");
    }

    let server = StorageServer::bind(&opts.bind)?
        .with_deadlines(opts.deadlines())
        .with_buffer_size(opts.buffer_size())
        .with_logger(logger::from_option(opts.log_file.as_deref()));

    match opts.mode {
        ServeMode::Files => server.serve_files(&canonical_root),
        ServeMode::Pushdown => {
            let threads = opts.engine_threads();
            let engine = DuckDbEngine::open(opts.database.as_deref())
                .context("Failed to open DuckDB for pushdown mode")?;
            println!("  Engine threads: {}", threads);
            let service = PushdownService::new(
                Box::new(engine),
                Box::new(TableNameEstimator::storage_default()),
                threads,
            );
            server.serve_pushdown(service)
        }
    }
}
