use crate::config::ClientConfig;
use crate::consumer::StreamConsumer;
use crate::measurements::{BenchmarkReport, Sample, Summary};
use crate::security::{BoxedTransport, ClientCredentials, SecurityContext};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Progress event types reported during a benchmark run.
///
/// # Examples
///
/// ```no_run
/// use streamperf::{Client, ClientConfig, ProgressEvent};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::new("127.0.0.1:5000").with_samples(3);
///
/// let client = Client::new(config)?.with_callback(|event: ProgressEvent| match event {
///     ProgressEvent::RunStarted { n_samples, .. } => println!("Running {} samples", n_samples),
///     ProgressEvent::SampleCompleted { index, sample } => {
///         println!("Sample {}: {} bytes", index, sample.total_bytes);
///     }
///     ProgressEvent::RunCompleted { summary: Some(summary) } => {
///         println!("Mean: {:.3}", summary.mean_gibps);
///     }
///     ProgressEvent::RunCompleted { summary: None } => println!("Mean: undefined"),
///     ProgressEvent::Error(msg) => eprintln!("Error: {}", msg),
/// });
///
/// client.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// Run is starting. Emitted once before the first dial.
    RunStarted {
        n_samples: usize,
        security: &'static str,
    },
    /// One transfer finished; `index` is 1-based.
    SampleCompleted { index: usize, sample: Sample },
    /// Every sample finished. `summary` is `None` when no sample had a
    /// defined throughput.
    RunCompleted { summary: Option<Summary> },
    /// The run failed. No further events follow.
    Error(String),
}

/// Callback trait for receiving progress updates during a run.
///
/// Implemented automatically for any closure taking a [`ProgressEvent`].
///
/// ```
/// use streamperf::{ProgressCallback, ProgressEvent};
///
/// struct Printer;
///
/// impl ProgressCallback for Printer {
///     fn on_progress(&self, event: ProgressEvent) {
///         println!("{:?}", event);
///     }
/// }
/// ```
pub trait ProgressCallback: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

impl<F> ProgressCallback for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn on_progress(&self, event: ProgressEvent) {
        self(event)
    }
}

type CallbackRef = Arc<dyn ProgressCallback>;

/// Benchmark client.
///
/// Runs `n_samples` transfers strictly one after another and reports one
/// throughput sample per transfer. Samples never overlap, so each one
/// measures a single transfer rather than contention between several.
///
/// By default all samples share one connection, each sample being one
/// request on it. [`ClientConfig::with_reuse_connection`] switches to a
/// fresh connection, and handshake, per sample; the handshake is not part
/// of the measured time either way.
///
/// The first failing sample aborts the run and no summary is produced.
/// The error carries the 1-based index of that sample.
///
/// # Examples
///
/// ```no_run
/// use streamperf::{Client, ClientConfig, SecurityMode, TlsFiles};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::new("server.example.com:5000")
///     .with_samples(10)
///     .with_security(SecurityMode::ServerTls(TlsFiles::client_defaults()));
///
/// let client = Client::new(config)?;
/// let report = client.run().await?;
/// if let Some(summary) = &report.summary {
///     println!("Mean throughput: {:.3} GiB/s", summary.mean_gibps);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: ClientConfig,
    credentials: ClientCredentials,
    consumer: StreamConsumer,
    callback: Option<CallbackRef>,
    cancellation_token: CancellationToken,
}

impl Client {
    /// Creates a client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration and
    /// [`Error::Credential`] when certificate material cannot be loaded.
    ///
    /// # Examples
    ///
    /// ```
    /// use streamperf::{Client, ClientConfig};
    ///
    /// let client = Client::new(ClientConfig::new("127.0.0.1:5000")).expect("valid config");
    /// ```
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let credentials = SecurityContext::new(config.security.clone()).client_credentials()?;

        let decode_batches = config
            .ticket
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("table"));
        let consumer = StreamConsumer::new()
            .with_read_timeout(config.read_timeout)
            .with_batch_decoding(decode_batches);

        Ok(Self {
            config,
            credentials,
            consumer,
            callback: None,
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Attaches a progress callback.
    pub fn with_callback<C: ProgressCallback + 'static>(mut self, callback: C) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    fn notify(&self, event: ProgressEvent) {
        if let Some(callback) = &self.callback {
            callback.on_progress(event);
        }
    }

    /// Token that aborts the run when cancelled.
    ///
    /// The in-flight sample is dropped and [`Client::run`] returns
    /// [`Error::Cancelled`] with that sample's index.
    ///
    /// ```no_run
    /// use streamperf::{Client, ClientConfig};
    /// use std::time::Duration;
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = Client::new(ClientConfig::new("127.0.0.1:5000"))?;
    /// let cancel_token = client.cancellation_token().clone();
    ///
    /// tokio::spawn(async move {
    ///     tokio::time::sleep(Duration::from_secs(5)).await;
    ///     cancel_token.cancel();
    /// });
    ///
    /// let result = client.run().await;
    /// # Ok(())
    /// # }
    /// ```
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation_token
    }

    /// Runs the benchmark and returns every sample with their summary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Dial`] or [`Error::Handshake`] when the shared
    /// connection cannot be set up, [`Error::Sample`] wrapping the first
    /// per-sample failure and [`Error::Cancelled`] when the token fires.
    pub async fn run(&self) -> Result<BenchmarkReport> {
        let security = self.config.security.name();
        info!(
            "Running {} samples against {} ({})",
            self.config.n_samples, self.config.addr, security
        );
        self.notify(ProgressEvent::RunStarted {
            n_samples: self.config.n_samples,
            security,
        });

        let result = self.collect_samples().await.map(|samples| {
            let summary = match Summary::from_samples(&samples) {
                Ok(summary) => Some(summary),
                Err(e) => {
                    warn!("No mean throughput: {}", e);
                    None
                }
            };
            BenchmarkReport {
                security: security.to_string(),
                samples,
                summary,
            }
        });

        match result {
            Ok(report) => {
                if let Some(summary) = &report.summary {
                    info!(
                        "Mean throughput over {} samples: {:.3} GiB/s",
                        summary.count, summary.mean_gibps
                    );
                }
                self.notify(ProgressEvent::RunCompleted {
                    summary: report.summary.clone(),
                });
                if !self.config.json {
                    print_summary(report.summary.as_ref());
                }
                Ok(report)
            }
            Err(e) => {
                error!("Benchmark failed: {}", e);
                self.notify(ProgressEvent::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn collect_samples(&self) -> Result<Vec<Sample>> {
        let n_samples = self.config.n_samples;
        let mut samples = Vec::with_capacity(n_samples);
        let mut shared = if self.config.reuse_connection {
            Some(self.cancellable(1, self.dial()).await?)
        } else {
            None
        };

        for index in 1..=n_samples {
            let sample = self
                .cancellable(index, self.run_sample(&mut shared))
                .await
                .map_err(|e| e.in_sample(index))?;

            debug!("Sample {} complete: {:?}", index, sample);
            if !self.config.json {
                print_sample(&sample);
            }
            self.notify(ProgressEvent::SampleCompleted {
                index,
                sample: sample.clone(),
            });
            samples.push(sample);
        }

        if let Some(mut stream) = shared {
            if let Err(e) = stream.shutdown().await {
                debug!("Error closing connection: {}", e);
            }
        }
        Ok(samples)
    }

    /// Races `operation` against the cancellation token.
    async fn cancellable<T>(
        &self,
        index: usize,
        operation: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancellation_token.cancelled() => {
                info!("Benchmark cancelled during sample {}", index);
                Err(Error::Cancelled { index })
            }
            result = operation => result,
        }
    }

    /// One transfer, on the shared connection when there is one.
    async fn run_sample(&self, shared: &mut Option<BoxedTransport>) -> Result<Sample> {
        let ticket = self.config.ticket.as_deref();

        if self.config.reuse_connection {
            let mut stream = match shared.take() {
                Some(stream) => stream,
                None => self.dial().await?,
            };
            let sample = self.consumer.consume(&mut stream, ticket).await?;
            *shared = Some(stream);
            Ok(sample)
        } else {
            let mut stream = self.dial().await?;
            let sample = self.consumer.consume(&mut stream, ticket).await?;
            if let Err(e) = stream.shutdown().await {
                debug!("Error closing connection: {}", e);
            }
            Ok(sample)
        }
    }

    /// Connects and runs the handshake, bounded by the connect timeout.
    async fn dial(&self) -> Result<BoxedTransport> {
        let addr = &self.config.addr;
        let connect = async {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| Error::Dial(format!("{}: {}", addr, e)))?;
            stream.set_nodelay(true)?;
            debug!("Connected to {}", addr);
            self.credentials.connect(stream).await
        };

        match self.config.connect_timeout {
            None => connect.await,
            Some(limit) => time::timeout(limit, connect).await.map_err(|_| {
                Error::Dial(format!("{}: no connection within {:?}", addr, limit))
            })?,
        }
    }
}

fn print_sample(sample: &Sample) {
    println!("got {} b in {} ms", sample.total_bytes, sample.elapsed_millis);
    match sample.throughput_gibps {
        Some(gibps) => println!("throughput: {} GiB/s", gibps),
        None => println!("throughput: undefined (no measurable time)"),
    }
}

fn print_summary(summary: Option<&Summary>) {
    println!("- - - - - - - - - - - - - - - - - - - - - - - - -");
    let Some(summary) = summary else {
        println!("mean throughput: undefined (every transfer took under 1 ms)");
        return;
    };
    println!(
        "mean throughput: {} GiB/s over {} samples",
        summary.mean_gibps, summary.count
    );
    println!(
        "min {:.3}  max {:.3}  stddev {:.3} GiB/s, {} bytes total",
        summary.min_gibps, summary.max_gibps, summary.stddev_gibps, summary.total_bytes
    );
}
