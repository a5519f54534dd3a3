use clap::{Args, Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use streamperf::config::{
    DEFAULT_BATCH_ROWS, DEFAULT_CHUNK_SIZE, DEFAULT_PORT, DEFAULT_SAMPLES, DEFAULT_SERVER_NAME,
    DEFAULT_SIZE, DEFAULT_TABLE_COLS, DEFAULT_TABLE_ROWS,
};
use streamperf::{
    Client, ClientConfig, DatasetKind, SecurityMode, Server, ServerConfig, TlsFiles,
};

#[derive(Parser)]
#[command(name = "streamperf")]
#[command(about = "Streaming throughput benchmark over plaintext, TLS or mutual TLS", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Transport security flags shared by both subcommands.
#[derive(Args)]
struct SecurityArgs {
    /// Use server-authenticated TLS
    #[arg(long, conflicts_with = "mtls")]
    tls: bool,

    /// Use mutual TLS
    #[arg(long)]
    mtls: bool,
}

impl SecurityArgs {
    fn mode(&self, files: TlsFiles) -> SecurityMode {
        if self.mtls {
            SecurityMode::MutualTls(files)
        } else if self.tls {
            SecurityMode::ServerTls(files)
        } else {
            SecurityMode::Plaintext
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        /// Port to listen on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Bind to specific address
        #[arg(short, long)]
        bind: Option<IpAddr>,

        /// Bytes of random payload to generate
        #[arg(short, long, default_value_t = DEFAULT_SIZE)]
        size: u64,

        /// Bytes per streamed chunk
        #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunksize: usize,

        /// Dataset to serve: blob or table
        #[arg(long, default_value = "blob")]
        dataset: DatasetKind,

        /// Rows of the table dataset
        #[arg(long, default_value_t = DEFAULT_TABLE_ROWS)]
        rows: usize,

        /// Float64 columns of the table dataset
        #[arg(long, default_value_t = DEFAULT_TABLE_COLS)]
        cols: usize,

        /// Rows per streamed record batch
        #[arg(long, default_value_t = DEFAULT_BATCH_ROWS)]
        batch_rows: usize,

        #[command(flatten)]
        security: SecurityArgs,

        /// Server certificate chain (PEM)
        #[arg(long, default_value = "tls/server_cert.pem")]
        cert: PathBuf,

        /// Server private key (PEM)
        #[arg(long, default_value = "tls/server_key.pem")]
        key: PathBuf,

        /// CA bundle client certificates must chain to (mutual TLS)
        #[arg(long, default_value = "tls/client_ca_cert.pem")]
        client_ca: PathBuf,
    },

    /// Run in client mode
    Client {
        /// Server address as host:port
        #[arg(short, long, default_value_t = format!("localhost:{}", DEFAULT_PORT))]
        addr: String,

        /// Number of transfers to measure
        #[arg(short, long, default_value_t = DEFAULT_SAMPLES)]
        nsamples: usize,

        /// Dataset to request (defaults to whatever the server holds)
        #[arg(long)]
        ticket: Option<String>,

        /// Dial a fresh connection for every sample
        #[arg(long)]
        fresh_connections: bool,

        /// Seconds allowed for connect plus handshake
        #[arg(long)]
        connect_timeout: Option<u64>,

        /// Seconds allowed between frames
        #[arg(long)]
        read_timeout: Option<u64>,

        #[command(flatten)]
        security: SecurityArgs,

        /// CA bundle the server certificate must chain to
        #[arg(long, default_value = "tls/ca_cert.pem")]
        ca: PathBuf,

        /// Client certificate chain (PEM, mutual TLS)
        #[arg(long, default_value = "tls/client_cert.pem")]
        cert: PathBuf,

        /// Client private key (PEM, mutual TLS)
        #[arg(long, default_value = "tls/client_key.pem")]
        key: PathBuf,

        /// Name the server certificate is verified against
        #[arg(long, default_value = DEFAULT_SERVER_NAME)]
        server_name: String,

        /// Output in JSON format
        #[arg(short = 'J', long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Server {
            port,
            bind,
            size,
            chunksize,
            dataset,
            rows,
            cols,
            batch_rows,
            security,
            cert,
            key,
            client_ca,
        } => {
            let files = TlsFiles::server_defaults()
                .with_cert(cert)
                .with_key(key)
                .with_ca(client_ca);

            let mut config = ServerConfig::new(port)
                .with_size(size)
                .with_chunk_size(chunksize)
                .with_dataset(dataset)
                .with_table_shape(rows, cols)
                .with_batch_rows(batch_rows)
                .with_security(security.mode(files));

            if let Some(bind_addr) = bind {
                config = config.with_bind_addr(bind_addr);
            }

            let server = Server::from_config(config)?;
            server.run().await?;
        }

        Commands::Client {
            addr,
            nsamples,
            ticket,
            fresh_connections,
            connect_timeout,
            read_timeout,
            security,
            ca,
            cert,
            key,
            server_name,
            json,
        } => {
            let files = TlsFiles::client_defaults()
                .with_ca(ca)
                .with_cert(cert)
                .with_key(key)
                .with_server_name(server_name);

            let mut config = ClientConfig::new(addr)
                .with_samples(nsamples)
                .with_reuse_connection(!fresh_connections)
                .with_security(security.mode(files))
                .with_json(json);

            if let Some(ticket) = ticket {
                config = config.with_ticket(ticket);
            }
            if let Some(secs) = connect_timeout {
                config = config.with_connect_timeout(Duration::from_secs(secs));
            }
            if let Some(secs) = read_timeout {
                config = config.with_read_timeout(Duration::from_secs(secs));
            }

            let client = Client::new(config)?;
            let report = client.run().await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
        }
    }

    Ok(())
}
