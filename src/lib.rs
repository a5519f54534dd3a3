//! streamperf - streaming throughput benchmark
//!
//! A server holds one in-memory dataset and streams it in bounded chunks;
//! a client requests it repeatedly, times each transfer and reports the
//! throughput in GiB/s. Connections can run in plaintext, over
//! server-authenticated TLS, or over mutual TLS.
//!
//! # Features
//!
//! - Random byte blob streamed in fixed-size chunks
//! - Columnar table streamed in row-bounded record batches
//! - Shared or per-sample connections
//! - Per-sample results plus mean, min, max and standard deviation
//! - JSON report output
//! - Asynchronous I/O using tokio

pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod measurements;
pub mod protocol;
pub mod security;
pub mod server;
pub mod source;
pub mod streamer;

pub use client::{Client, ProgressCallback, ProgressEvent};
pub use config::{ClientConfig, DatasetKind, SecurityMode, ServerConfig, TlsFiles};
pub use error::{Error, Result, TransferPhase};
pub use measurements::{mean, BenchmarkReport, Sample, ServerStats, Summary};
pub use security::SecurityContext;
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
