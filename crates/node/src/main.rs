//! PeerLink node
//!
//! Command-line front end for listening, dialing and inspecting the node
//! identity.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use peerlink_node::config::Config;
use peerlink_node::network::tls::{client_config_trusting, insecure_client_config, load_cert};
use peerlink_node::network::SelfSignedCert;
use peerlink_node::node::load_or_generate_identity;
use peerlink_node::{ConnectionHandle, ConnectionId, Node};

/// Datagram tag used by the CLI for text messages.
const MESSAGE_TAG: u8 = 0x01;

/// PeerLink - authenticated peer-to-peer connections over QUIC.
#[derive(Parser, Debug)]
#[command(name = "peerlink")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Accept peer connections until interrupted
    Listen {
        /// Address to listen on (overrides the config file)
        #[arg(long, short)]
        addr: Option<String>,
    },

    /// Connect to a peer
    Connect {
        /// Peer URI, e.g. quic://192.0.2.10:4433
        uri: String,

        /// DER certificate of the peer to trust
        #[arg(long, value_name = "FILE", conflicts_with = "insecure")]
        cert: Option<PathBuf>,

        /// Accept any peer certificate
        #[arg(long)]
        insecure: bool,

        /// Text to send once connected
        #[arg(long, short)]
        message: Option<String>,
    },

    /// Print this node's identity
    Identity,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };
    config.apply_env_overrides();
    config.validate()?;

    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.node.log_level.to_lowercase()
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Some(config_path) = &cli.config {
        tracing::info!("Using config file: {:?}", config_path);
    }

    match cli.command {
        Commands::Listen { addr } => {
            if let Some(addr) = addr {
                config.network.listen_addr = addr;
            }
            run_listener(config).await
        }
        Commands::Connect {
            uri,
            cert,
            insecure,
            message,
        } => run_connect(config, &uri, cert, insecure, message).await,
        Commands::Identity => {
            let identity = load_or_generate_identity(&config.identity_path())?;
            println!("Node ID:    {}", identity.fingerprint());
            println!("Public key: {}", hex::encode(identity.public_key_bytes()));
            println!("Stored at:  {}", config.identity_path().display());
            Ok(())
        }
    }
}

fn build_node(config: &Config) -> anyhow::Result<Node> {
    let identity = load_or_generate_identity(&config.identity_path())?;
    let settings = config.connection_settings()?;
    let node = Node::new(identity, settings);

    node.register_datagram_handler(
        MESSAGE_TAG,
        Arc::new(|conn_id: ConnectionId, payload: Bytes| {
            tracing::info!(
                conn_id = %conn_id,
                "Datagram message: {}",
                String::from_utf8_lossy(&payload)
            );
        }),
    );
    Ok(node)
}

async fn run_listener(config: Config) -> anyhow::Result<()> {
    let addr = config.listen_socket_addr()?;
    let node = build_node(&config)?;

    let cert = SelfSignedCert::generate(&config.network.server_name)?;
    cert.save_cert(&config.cert_path())
        .with_context(|| format!("Failed to write certificate: {}", config.cert_path().display()))?;
    tracing::info!("Development certificate written to {:?}", config.cert_path());

    let local = node.listen(addr, cert.server_config()?)?;
    println!("Node {} listening on quic://{}", node.identity().fingerprint(), local);

    let shutdown = wait_for_shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = node.accept() => match accepted {
                Some(handle) => {
                    print_peer(&handle);
                    tokio::spawn(log_traffic(handle));
                }
                None => break,
            },
        }
    }

    node.shutdown().await;
    Ok(())
}

async fn run_connect(
    config: Config,
    uri: &str,
    cert: Option<PathBuf>,
    insecure: bool,
    message: Option<String>,
) -> anyhow::Result<()> {
    let tls = match (cert, insecure) {
        (Some(path), _) => {
            let cert = load_cert(&path)
                .with_context(|| format!("Failed to read certificate: {}", path.display()))?;
            client_config_trusting(cert)?
        }
        (None, true) => {
            tracing::warn!("Peer certificate verification is disabled");
            insecure_client_config()?
        }
        (None, false) => anyhow::bail!("Pass --cert FILE to trust a peer, or --insecure"),
    };

    let node = build_node(&config)?;
    let handle = node
        .connect(uri, tls)
        .await
        .with_context(|| format!("Failed to connect to {}", uri))?;
    print_peer(&handle);

    if let Some(message) = message {
        if handle.datagrams_enabled() {
            handle.send_unreliable(MESSAGE_TAG, message.as_bytes())?;
        } else {
            handle.send(message.as_bytes())?;
        }
    }

    tokio::spawn(log_traffic(handle.clone()));
    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        reason = handle.closed() => println!("Connection closed: {}", reason),
    }

    node.shutdown().await;
    Ok(())
}

fn print_peer(handle: &ConnectionHandle) {
    println!("Connection {} ({})", handle.id(), handle.role());
    println!("  peer:     {}", handle.peer_identity().fingerprint());
    println!("  remote:   {}", handle.remote_address());
    println!("  version:  {}", handle.peer_version());
    println!("  config:   {}", handle.negotiated_config());
    println!("  mtu:      {}", handle.peer_mtu());
    if let Some(observed) = handle.observed_address() {
        println!("  observed: {}", observed);
    }
}

/// Log reliable payloads until the connection closes.
async fn log_traffic(handle: ConnectionHandle) {
    while let Ok(payload) = handle.recv().await {
        tracing::info!(
            conn_id = %handle.id(),
            len = payload.len(),
            "Message: {}",
            String::from_utf8_lossy(&payload)
        );
    }
    let reason = handle.closed().await;
    tracing::info!(conn_id = %handle.id(), %reason, "Peer disconnected");
}

async fn wait_for_shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Received shutdown signal");
}
