//! PWAR peer simulator
//!
//! Stands in for the remote peer (e.g. a Windows ASIO driver): receives
//! relay packets, stamps t2/t3, and echoes the audio back, creating a full
//! loopback test environment on one machine or across a LAN.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pwar::{PeerConfig, PeerLoopback};

#[derive(Parser, Debug)]
#[command(
    name = "pwar-peer",
    version,
    about = "Loopback peer simulator for the PWAR relay"
)]
struct Cli {
    /// IP address of the relay host replies are sent to [default: 127.0.0.1]
    #[arg(short, long)]
    server: Option<IpAddr>,

    /// Port of the relay host replies are sent to [default: 8321]
    #[arg(short, long)]
    port: Option<u16>,

    /// Local port relay packets arrive on [default: 8322]
    #[arg(short = 'c', long = "client-port")]
    client_port: Option<u16>,

    /// Optional key=value config file (server_ip, server_port, listen_port);
    /// command-line flags override it
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => PeerConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => PeerConfig::default(),
    };

    // Flags given explicitly win over the config file.
    if let Some(ip) = cli.server {
        config.reply_addr.set_ip(ip);
    }
    if let Some(port) = cli.port {
        config.reply_addr.set_port(port);
    }
    if let Some(port) = cli.client_port {
        config.listen_port = port;
    }

    tracing::info!("PWAR peer simulator");
    tracing::info!("  relay:       {}", config.reply_addr);
    tracing::info!("  listening:   {}", config.listen_port);

    let mut peer = PeerLoopback::start(config).context("failed to start peer loopback")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::Relaxed);
    })
    .context("failed to install signal handler")?;

    tracing::info!("echoing packets, press Ctrl+C to stop");
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::info!(
        processed = peer.packets_processed(),
        "shutting down peer simulator"
    );
    peer.stop();

    Ok(())
}
