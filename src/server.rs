use crate::config::ServerConfig;
use crate::measurements::{ServerStats, ServerStatsCollector};
use crate::protocol::{deserialize_message, write_error, Message, PROTOCOL_VERSION};
use crate::security::{SecurityContext, ServerCredentials};
use crate::source::Dataset;
use crate::streamer::serve_dataset;
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Pause after a failed `accept`, e.g. when out of file descriptors.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Waits out [`ACCEPT_BACKOFF`] unless `shutdown` fires first.
async fn accept_backoff(shutdown: &CancellationToken) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = time::sleep(ACCEPT_BACKOFF) => {}
    }
}

/// Streaming server.
///
/// The `Server` holds one immutable dataset for its whole lifetime and
/// streams it to every client that asks. Each accepted connection runs in
/// its own task; all tasks read the same dataset without locking.
///
/// A connection may carry several requests one after another. Each request
/// is answered with the full dataset followed by an end frame, or with an
/// error frame when the request names a dataset the server does not hold.
///
/// # Examples
///
/// ## Plaintext server
///
/// ```no_run
/// use streamperf::{Server, ServerConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ServerConfig::new(5000).with_size(1024 * 1024 * 1024);
/// let server = Server::from_config(config)?;
///
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Mutual TLS with graceful shutdown
///
/// ```no_run
/// use streamperf::{SecurityMode, Server, ServerConfig, TlsFiles};
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ServerConfig::new(5000)
///     .with_security(SecurityMode::MutualTls(TlsFiles::server_defaults()));
/// let server = Server::from_config(config)?;
///
/// let shutdown = CancellationToken::new();
/// let trigger = shutdown.clone();
/// tokio::spawn(async move {
///     tokio::signal::ctrl_c().await.ok();
///     trigger.cancel();
/// });
///
/// server.run_until(shutdown).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    config: ServerConfig,
    dataset: Arc<Dataset>,
    credentials: ServerCredentials,
    stats: ServerStatsCollector,
}

impl Server {
    /// Creates a server that streams `dataset`.
    ///
    /// The configuration is validated and the credentials for its security
    /// mode are loaded here, so a bad certificate fails before any socket
    /// is opened. `config.dataset` is ignored in favour of `dataset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an invalid configuration and
    /// [`Error::Credential`] when certificate material cannot be loaded.
    pub fn new(config: ServerConfig, dataset: Dataset) -> Result<Self> {
        config.validate()?;
        let credentials = SecurityContext::new(config.security.clone()).server_credentials()?;

        Ok(Self {
            config,
            dataset: Arc::new(dataset),
            credentials,
            stats: ServerStatsCollector::new(),
        })
    }

    /// Creates a server and generates the dataset its configuration describes.
    pub fn from_config(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        info!("Generating {} dataset", config.dataset.name());
        let dataset = Dataset::generate(&config)?;
        Self::new(config, dataset)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Binds the configured address.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Listen`] if the address cannot be bound.
    pub async fn listen(&self) -> Result<TcpListener> {
        let addr = self.config.listen_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Listen(format!("{}: {}", addr, e)))?;
        let local = listener
            .local_addr()
            .map_err(|e| Error::Listen(format!("{}: {}", addr, e)))?;
        info!(
            "Serving {} on {} ({})",
            self.dataset.describe(),
            local,
            self.config.security.name()
        );
        Ok(listener)
    }

    /// Accepts connections on `listener` until `shutdown` is cancelled.
    ///
    /// Cancelling also aborts transfers still in flight.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Server shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("New connection from {}", addr);
                        let connection = Connection {
                            dataset: self.dataset.clone(),
                            chunk_size: self.config.chunk_size,
                            batch_rows: self.config.batch_rows,
                            credentials: self.credentials.clone(),
                            stats: self.stats.clone(),
                        };
                        let shutdown = shutdown.child_token();

                        tokio::spawn(async move {
                            tokio::select! {
                                result = connection.handle(stream, addr) => {
                                    if let Err(e) = result {
                                        error!("Error handling client {}: {}", addr, e);
                                    }
                                }
                                _ = shutdown.cancelled() => {
                                    debug!("Dropping connection from {} on shutdown", addr);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        accept_backoff(&shutdown).await;
                    }
                }
            }
        }
    }

    /// Binds and serves until `shutdown` is cancelled.
    pub async fn run_until(&self, shutdown: CancellationToken) -> Result<()> {
        let listener = self.listen().await?;
        self.serve(listener, shutdown).await
    }

    /// Binds and serves forever.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Listen`] if the port cannot be bound. Failures of
    /// individual connections are logged and never end the server.
    pub async fn run(&self) -> Result<()> {
        self.run_until(CancellationToken::new()).await
    }

    /// Snapshot of what the server has streamed so far.
    pub fn stats(&self) -> ServerStats {
        self.stats.get()
    }
}

/// Everything one connection task needs.
struct Connection {
    dataset: Arc<Dataset>,
    chunk_size: usize,
    batch_rows: usize,
    credentials: ServerCredentials,
    stats: ServerStatsCollector,
}

impl Connection {
    async fn handle(self, stream: TcpStream, addr: SocketAddr) -> Result<()> {
        self.stats.record_connection();
        stream.set_nodelay(true)?;

        let mut transport = match self.credentials.accept(stream).await {
            Ok(transport) => transport,
            Err(e) => {
                self.stats.record_handshake_failure();
                return Err(e);
            }
        };
        self.serve_requests(&mut transport, addr).await
    }

    /// Answers requests until the client closes the connection.
    async fn serve_requests<S>(&self, stream: &mut S, addr: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(message) = deserialize_message(stream).await? {
            let Message::Request { version, ticket } = message;

            if version != PROTOCOL_VERSION {
                self.stats.record_rejected();
                write_error(
                    stream,
                    &format!("unsupported protocol version {}", version),
                )
                .await?;
                return Err(Error::Protocol(format!(
                    "Client {} speaks protocol version {}, expected {}",
                    addr, version, PROTOCOL_VERSION
                )));
            }

            if !self.dataset.matches_ticket(ticket.as_deref()) {
                let ticket = ticket.unwrap_or_default();
                warn!("Client {} requested unknown dataset {:?}", addr, ticket);
                self.stats.record_rejected();
                write_error(stream, &format!("dataset not found: {}", ticket)).await?;
                continue;
            }

            match serve_dataset(stream, &self.dataset, self.chunk_size, self.batch_rows).await {
                Ok(session) => {
                    info!(
                        "Streamed {} bytes in {} chunks to {} in {:?}",
                        session.bytes_so_far,
                        session.chunk_count,
                        addr,
                        session.elapsed()
                    );
                    self.stats.record_transfer(&session);
                }
                Err(e) => {
                    self.stats.record_failed_transfer();
                    return Err(e);
                }
            }
        }

        debug!("Client {} closed the connection", addr);
        Ok(())
    }
}
