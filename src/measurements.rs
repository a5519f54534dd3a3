use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Bytes per GiB.
pub const GIB: f64 = (1u64 << 30) as f64;

/// Throughput in GiB/s over whole elapsed milliseconds, or `None` when
/// the transfer finished within the same millisecond.
///
/// # Examples
///
/// ```
/// use streamperf::measurements::throughput_gibps;
///
/// assert_eq!(throughput_gibps(1 << 30, 1000), Some(1.0));
/// assert_eq!(throughput_gibps(1 << 30, 0), None);
/// ```
pub fn throughput_gibps(total_bytes: u64, elapsed_millis: u64) -> Option<f64> {
    if elapsed_millis == 0 {
        return None;
    }
    Some((total_bytes as f64 / GIB) / (elapsed_millis as f64 / 1000.0))
}

/// State of one in-flight transfer.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub start_time: Instant,
    pub bytes_so_far: u64,
    pub chunk_count: u64,
}

impl TransferSession {
    pub fn start() -> Self {
        Self {
            start_time: Instant::now(),
            bytes_so_far: 0,
            chunk_count: 0,
        }
    }

    pub fn record_chunk(&mut self, len: usize) {
        self.bytes_so_far += len as u64;
        self.chunk_count += 1;
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Measurement of one completed transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub total_bytes: u64,
    pub elapsed_millis: u64,
    pub chunk_count: u64,
    /// Rows received, when record batches were decoded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
    /// `None` when the transfer took no measurable time
    pub throughput_gibps: Option<f64>,
}

impl Sample {
    /// Elapsed time is truncated to whole milliseconds before the
    /// throughput is derived from it.
    pub fn new(total_bytes: u64, elapsed: Duration, chunk_count: u64) -> Self {
        let elapsed_millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        Self {
            total_bytes,
            elapsed_millis,
            chunk_count,
            rows: None,
            throughput_gibps: throughput_gibps(total_bytes, elapsed_millis),
        }
    }

    pub fn with_rows(mut self, rows: u64) -> Self {
        self.rows = Some(rows);
        self
    }

    pub(crate) fn from_session(session: &TransferSession) -> Self {
        Self::new(session.bytes_so_far, session.elapsed(), session.chunk_count)
    }
}

fn defined_throughputs(samples: &[Sample]) -> Result<Vec<f64>> {
    if samples.is_empty() {
        return Err(Error::Stats("No samples to summarize".to_string()));
    }
    let values: Vec<f64> = samples.iter().filter_map(|s| s.throughput_gibps).collect();
    if values.is_empty() {
        return Err(Error::Stats(
            "No sample has a defined throughput".to_string(),
        ));
    }
    Ok(values)
}

/// Arithmetic mean throughput over the samples with a defined throughput.
///
/// # Errors
///
/// Returns [`Error::Stats`] for an empty slice or when every sample has an
/// undefined throughput.
pub fn mean(samples: &[Sample]) -> Result<f64> {
    let values = defined_throughputs(samples)?;
    Ok(values.iter().sum::<f64>() / values.len() as f64)
}

/// Aggregate statistics over a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Samples that contributed (those with a defined throughput)
    pub count: usize,
    pub mean_gibps: f64,
    pub min_gibps: f64,
    pub max_gibps: f64,
    /// Population standard deviation
    pub stddev_gibps: f64,
    pub total_bytes: u64,
}

impl Summary {
    pub fn from_samples(samples: &[Sample]) -> Result<Self> {
        let values = defined_throughputs(samples)?;
        let count = values.len();
        let mean = values.iter().sum::<f64>() / count as f64;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / count as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);

        Ok(Self {
            count,
            mean_gibps: mean,
            min_gibps: min,
            max_gibps: max,
            stddev_gibps: variance.sqrt(),
            total_bytes: samples.iter().map(|s| s.total_bytes).sum(),
        })
    }
}

/// Samples of a finished run plus their summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub security: String,
    pub samples: Vec<Sample>,
    /// `None` when no sample has a defined throughput
    pub summary: Option<Summary>,
}

/// Totals of what a server has streamed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStats {
    pub connections: u64,
    pub handshake_failures: u64,
    pub transfers_completed: u64,
    pub transfers_failed: u64,
    pub requests_rejected: u64,
    pub bytes_sent: u64,
    pub chunks_sent: u64,
}

/// Thread-safe server statistics shared by connection tasks.
#[derive(Debug, Clone, Default)]
pub struct ServerStatsCollector {
    inner: Arc<Mutex<ServerStats>>,
}

impl ServerStatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connection(&self) {
        self.inner.lock().connections += 1;
    }

    pub fn record_handshake_failure(&self) {
        self.inner.lock().handshake_failures += 1;
    }

    pub fn record_rejected(&self) {
        self.inner.lock().requests_rejected += 1;
    }

    pub fn record_transfer(&self, session: &TransferSession) {
        let mut stats = self.inner.lock();
        stats.transfers_completed += 1;
        stats.bytes_sent += session.bytes_so_far;
        stats.chunks_sent += session.chunk_count;
    }

    pub fn record_failed_transfer(&self) {
        self.inner.lock().transfers_failed += 1;
    }

    pub fn get(&self) -> ServerStats {
        self.inner.lock().clone()
    }
}
