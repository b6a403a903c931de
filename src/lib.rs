//! Disaggregated storage/compute benchmark
//!
//! A storage node serves Parquet files (file mode) or executes SQL next to
//! the data (pushdown mode). The compute node either downloads what its
//! queries reference and runs them locally, or pushes the queries down.

pub mod cli;
pub mod config;
pub mod downloader;
pub mod engine;
pub mod envelope;
pub mod framing;
pub mod logger;
pub mod metrics;
pub mod net;
pub mod orchestrator;
pub mod progress;
pub mod protocol;
pub mod pushdown;
pub mod queries;
pub mod report;
pub mod server;
