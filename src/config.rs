use crate::source::encoded_batch_len;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Default server port.
pub const DEFAULT_PORT: u16 = 5000;

/// Default payload size: 10 GiB.
pub const DEFAULT_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Default bytes per streamed chunk.
pub const DEFAULT_CHUNK_SIZE: usize = 4_000_000;

/// Largest chunk a single frame can carry.
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024 * 1024;

/// Default number of transfers per benchmark run.
pub const DEFAULT_SAMPLES: usize = 10;

/// Default row count of the tabular dataset.
pub const DEFAULT_TABLE_ROWS: usize = 1_000_000;

/// Default column count of the tabular dataset.
pub const DEFAULT_TABLE_COLS: usize = 2;

/// Default number of rows per streamed record batch.
pub const DEFAULT_BATCH_ROWS: usize = 64_000;

/// Host name the server certificate is expected to carry.
pub const DEFAULT_SERVER_NAME: &str = "x.test.example.com";

/// Which dataset the server holds in memory.
///
/// # Examples
///
/// ```
/// use streamperf::DatasetKind;
///
/// assert_eq!(DatasetKind::Blob.name(), "blob");
/// assert_eq!("table".parse::<DatasetKind>().unwrap(), DatasetKind::Table);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetKind {
    /// Random bytes streamed in fixed-size chunks
    Blob,
    /// Columnar table streamed in row-bounded record batches
    Table,
}

impl DatasetKind {
    /// Ticket name under which the dataset is served.
    pub fn name(&self) -> &'static str {
        match self {
            DatasetKind::Blob => "blob",
            DatasetKind::Table => "table",
        }
    }
}

impl std::str::FromStr for DatasetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "blob" => Ok(DatasetKind::Blob),
            "table" => Ok(DatasetKind::Table),
            other => Err(Error::Config(format!("Unknown dataset: {}", other))),
        }
    }
}

/// Certificate material for a TLS-secured side of the connection.
///
/// Each side reads only the files its mode needs:
///
/// | mode        | server reads              | client reads                      |
/// |-------------|---------------------------|-----------------------------------|
/// | server TLS  | `cert`, `key`             | `ca`, `server_name`               |
/// | mutual TLS  | `cert`, `key`, `ca`       | `cert`, `key`, `ca`, `server_name`|
///
/// On the server `ca` is the bundle client certificates must chain to; on
/// the client it is the bundle the server certificate must chain to. Paths
/// are resolved against the working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsFiles {
    /// PEM certificate chain presented by this side
    pub cert: PathBuf,
    /// PEM private key matching `cert`
    pub key: PathBuf,
    /// PEM bundle of CAs trusted for the peer
    pub ca: PathBuf,
    /// Name the server certificate is verified against (client only)
    pub server_name: String,
}

impl TlsFiles {
    /// Default file locations for the server side.
    pub fn server_defaults() -> Self {
        Self {
            cert: PathBuf::from("tls/server_cert.pem"),
            key: PathBuf::from("tls/server_key.pem"),
            ca: PathBuf::from("tls/client_ca_cert.pem"),
            server_name: DEFAULT_SERVER_NAME.to_string(),
        }
    }

    /// Default file locations for the client side.
    pub fn client_defaults() -> Self {
        Self {
            cert: PathBuf::from("tls/client_cert.pem"),
            key: PathBuf::from("tls/client_key.pem"),
            ca: PathBuf::from("tls/ca_cert.pem"),
            server_name: DEFAULT_SERVER_NAME.to_string(),
        }
    }

    pub fn with_cert(mut self, cert: impl Into<PathBuf>) -> Self {
        self.cert = cert.into();
        self
    }

    pub fn with_key(mut self, key: impl Into<PathBuf>) -> Self {
        self.key = key.into();
        self
    }

    pub fn with_ca(mut self, ca: impl Into<PathBuf>) -> Self {
        self.ca = ca.into();
        self
    }

    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }
}

/// Transport security policy shared by the server and the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityMode {
    /// No transport security
    Plaintext,
    /// Server presents a certificate, client verifies it
    ServerTls(TlsFiles),
    /// Both sides present certificates and verify each other
    MutualTls(TlsFiles),
}

impl SecurityMode {
    /// Short name used in logs and reports.
    pub fn name(&self) -> &'static str {
        match self {
            SecurityMode::Plaintext => "plaintext",
            SecurityMode::ServerTls(_) => "tls",
            SecurityMode::MutualTls(_) => "mtls",
        }
    }
}

impl Default for SecurityMode {
    fn default() -> Self {
        SecurityMode::Plaintext
    }
}

/// Configuration of the streaming server.
///
/// Built once at startup and never mutated afterwards.
///
/// # Examples
///
/// ```
/// use streamperf::{DatasetKind, ServerConfig};
///
/// let config = ServerConfig::new(5000)
///     .with_size(64 * 1024 * 1024)
///     .with_chunk_size(1024 * 1024)
///     .with_dataset(DatasetKind::Blob);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.chunk_size, 1024 * 1024);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to (all interfaces when unset)
    pub bind_addr: Option<IpAddr>,

    /// Port to listen on; 0 picks an ephemeral port
    pub port: u16,

    /// Bytes of random payload for the blob dataset
    pub size: u64,

    /// Bytes per streamed chunk for the blob dataset
    pub chunk_size: usize,

    /// Which dataset to hold and serve
    pub dataset: DatasetKind,

    /// Rows of the tabular dataset
    pub table_rows: usize,

    /// Float64 columns of the tabular dataset
    pub table_cols: usize,

    /// Maximum rows per streamed record batch
    pub batch_rows: usize,

    /// Transport security mode
    pub security: SecurityMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: None,
            port: DEFAULT_PORT,
            size: DEFAULT_SIZE,
            chunk_size: DEFAULT_CHUNK_SIZE,
            dataset: DatasetKind::Blob,
            table_rows: DEFAULT_TABLE_ROWS,
            table_cols: DEFAULT_TABLE_COLS,
            batch_rows: DEFAULT_BATCH_ROWS,
            security: SecurityMode::Plaintext,
        }
    }
}

impl ServerConfig {
    /// Creates a server configuration listening on `port` with default settings.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    pub fn with_bind_addr(mut self, addr: IpAddr) -> Self {
        self.bind_addr = Some(addr);
        self
    }

    /// Sets the size in bytes of the generated blob.
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    /// Sets the number of bytes carried by each streamed chunk.
    ///
    /// Zero is rejected by [`ServerConfig::validate`].
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_dataset(mut self, dataset: DatasetKind) -> Self {
        self.dataset = dataset;
        self
    }

    /// Sets the shape of the tabular dataset.
    pub fn with_table_shape(mut self, rows: usize, cols: usize) -> Self {
        self.table_rows = rows;
        self.table_cols = cols;
        self
    }

    pub fn with_batch_rows(mut self, batch_rows: usize) -> Self {
        self.batch_rows = batch_rows;
        self
    }

    pub fn with_security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    /// Socket address string the server binds to.
    pub fn listen_addr(&self) -> String {
        let host = self
            .bind_addr
            .map(|a| a.to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        match self.bind_addr {
            Some(IpAddr::V6(_)) => format!("[{}]:{}", host, self.port),
            _ => format!("{}:{}", host, self.port),
        }
    }

    /// Checks the settings that have no meaningful interpretation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a chunk size of zero or above
    /// [`MAX_CHUNK_SIZE`], zero batch rows, a table without columns, or
    /// record batches that would encode to more than [`MAX_CHUNK_SIZE`].
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("Chunk size must be at least 1 byte".to_string()));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::Config(format!(
                "Chunk size {} exceeds the maximum of {} bytes",
                self.chunk_size, MAX_CHUNK_SIZE
            )));
        }
        if self.batch_rows == 0 {
            return Err(Error::Config("Batch rows must be at least 1".to_string()));
        }
        if self.dataset == DatasetKind::Table && self.table_cols == 0 {
            return Err(Error::Config("Table must have at least one column".to_string()));
        }
        if self.table_cols > u16::MAX as usize {
            return Err(Error::Config(format!(
                "Table cannot have more than {} columns",
                u16::MAX
            )));
        }
        if self.dataset == DatasetKind::Table {
            let rows = self.batch_rows.min(self.table_rows);
            match encoded_batch_len(self.table_cols, rows) {
                Some(len) if len <= MAX_CHUNK_SIZE => {}
                _ => {
                    return Err(Error::Config(format!(
                        "Record batches of {} rows x {} columns exceed the maximum chunk of {} bytes",
                        rows, self.table_cols, MAX_CHUNK_SIZE
                    )))
                }
            }
        }
        Ok(())
    }
}

/// Configuration of the benchmark client.
///
/// # Examples
///
/// ```
/// use streamperf::ClientConfig;
/// use std::time::Duration;
///
/// let config = ClientConfig::new("127.0.0.1:5000")
///     .with_samples(5)
///     .with_ticket("blob")
///     .with_connect_timeout(Duration::from_secs(5));
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.n_samples, 5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server address as `host:port`
    pub addr: String,

    /// Number of sequential transfers to measure
    pub n_samples: usize,

    /// Dataset to request; the server's own dataset when unset
    pub ticket: Option<String>,

    /// Run all samples over one connection instead of dialing per sample
    pub reuse_connection: bool,

    /// Limit on dial plus handshake time
    pub connect_timeout: Option<Duration>,

    /// Limit on the wait for any single frame
    pub read_timeout: Option<Duration>,

    /// Transport security mode
    pub security: SecurityMode,

    /// Print the report as JSON
    pub json: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: format!("localhost:{}", DEFAULT_PORT),
            n_samples: DEFAULT_SAMPLES,
            ticket: None,
            reuse_connection: true,
            connect_timeout: None,
            read_timeout: None,
            security: SecurityMode::Plaintext,
            json: false,
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration targeting `addr` with default settings.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    /// Sets how many transfers are measured.
    pub fn with_samples(mut self, n_samples: usize) -> Self {
        self.n_samples = n_samples;
        self
    }

    pub fn with_ticket(mut self, ticket: impl Into<String>) -> Self {
        self.ticket = Some(ticket.into());
        self
    }

    /// Selects one shared connection (`true`) or a fresh connection per sample.
    pub fn with_reuse_connection(mut self, reuse: bool) -> Self {
        self.reuse_connection = reuse;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_security(mut self, security: SecurityMode) -> Self {
        self.security = security;
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// Checks the settings that have no meaningful interpretation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when no samples are requested or the
    /// address is empty.
    pub fn validate(&self) -> Result<()> {
        if self.n_samples == 0 {
            return Err(Error::Config("At least one sample is required".to_string()));
        }
        if self.addr.trim().is_empty() {
            return Err(Error::Config("Server address is required".to_string()));
        }
        Ok(())
    }
}
