//! ledgernet daemon: runs the net core as a standalone relay.
//!
//! The chain behind the net layer is the in-memory one from
//! `ledgernet-nullables`; embedders with a real chain call
//! `ledgernet_node::start` directly.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use ledgernet_node::{init_logging, LogFormat, NodeConfig, ShutdownController};
use ledgernet_nullables::NullChain;
use ledgernet_types::{parse_hex_array, Digest};

/// How long the core gets to close its sessions after a signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "ledgernet-daemon", about = "ledgernet peer-to-peer node daemon")]
struct Cli {
    /// Path to a TOML configuration file. File settings are the base;
    /// CLI flags and env vars override them.
    #[arg(long, env = "LEDGERNET_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. "0.0.0.0:9876".
    #[arg(long, env = "LEDGERNET_LISTEN")]
    listen: Option<String>,

    /// Address advertised to peers.
    #[arg(long, env = "LEDGERNET_SERVER_ADDRESS")]
    server_address: Option<String>,

    /// Peers to dial (comma-separated: "1.2.3.4:9876,5.6.7.8:9876").
    #[arg(long = "peer", env = "LEDGERNET_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Inbound policy: any, producers, specified or none (comma-separated).
    #[arg(long = "allowed-connection", env = "LEDGERNET_ALLOWED_CONNECTIONS", value_delimiter = ',')]
    allowed_connections: Vec<String>,

    #[arg(long, env = "LEDGERNET_MAX_CLIENTS")]
    max_clients: Option<usize>,

    #[arg(long, env = "LEDGERNET_SYNC_FETCH_SPAN")]
    sync_fetch_span: Option<u32>,

    /// Hex chain id the node serves.
    #[arg(long, env = "LEDGERNET_CHAIN_ID")]
    chain_id: Option<String>,

    #[arg(long, env = "LEDGERNET_ENABLE_METRICS")]
    metrics: bool,

    /// Log format: "human" or "json".
    #[arg(long, env = "LEDGERNET_LOG_FORMAT")]
    log_format: Option<String>,

    /// Log level: "trace", "debug", "info", "warn", "error".
    #[arg(long, env = "LEDGERNET_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Run the node.
    Run,
    /// Print the effective configuration as TOML.
    Config,
    /// Generate a handshake signing key in `peer_private_keys` form.
    Keygen,
}

impl Cli {
    fn node_config(&self) -> anyhow::Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let path = path.to_string_lossy();
                NodeConfig::from_toml_file(&path)
                    .with_context(|| format!("loading config from {path}"))?
            }
            None => NodeConfig::default(),
        };
        if let Some(listen) = &self.listen {
            config.listen_endpoint = listen.clone();
        }
        if let Some(address) = &self.server_address {
            config.server_address = address.clone();
        }
        if !self.peers.is_empty() {
            config.peers = self.peers.clone();
        }
        if !self.allowed_connections.is_empty() {
            config.allowed_connections = self.allowed_connections.clone();
        }
        if let Some(max_clients) = self.max_clients {
            config.max_clients = max_clients;
        }
        if let Some(span) = self.sync_fetch_span {
            config.sync_fetch_span = span;
        }
        if let Some(format) = &self.log_format {
            config.log_format = format.clone();
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        config.enable_metrics |= self.metrics;
        Ok(config)
    }

    fn chain_id(&self) -> anyhow::Result<Digest> {
        match &self.chain_id {
            Some(hex) => Ok(Digest::new(
                parse_hex_array::<32>(hex).context("parsing --chain-id")?,
            )),
            None => Ok(Digest::ZERO),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.node_config()?;

    match cli.command {
        Command::Config => {
            println!("{}", config.to_toml_string()?);
            return Ok(());
        }
        Command::Keygen => {
            let kp = ledgernet_crypto::generate_keypair();
            println!("{}={}", hex::encode(kp.public.0), hex::encode(&kp.private.0));
            return Ok(());
        }
        Command::Run => {}
    }

    let format: LogFormat = config.log_format.parse()?;
    init_logging(format, &config.log_level)?;

    let chain = NullChain::new(cli.chain_id()?);
    let shutdown = ShutdownController::new();
    let (handle, task) = ledgernet_node::start(&config, chain, shutdown.subscribe()).await?;
    tracing::info!(
        listen = %handle.local_addr(),
        peers = config.peers.len(),
        "ledgernet daemon running"
    );

    shutdown.wait_for_signal().await;

    match tokio::time::timeout(SHUTDOWN_TIMEOUT, task).await {
        Ok(joined) => joined.context("net core task failed")?,
        Err(_) => tracing::warn!("net core did not stop in time"),
    }
    tracing::info!("ledgernet daemon exited cleanly");
    Ok(())
}
