//! PWAR relay front-end
//!
//! Bridges a local audio backend to a remote peer over UDP and runs until
//! INT/TERM. Exit code 0 on clean shutdown, 1 on configuration or init
//! failure.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pwar::audio;
use pwar::constants::{
    DEFAULT_BUFFER_FRAMES, DEFAULT_PCM_DEVICE, DEFAULT_RING_DEPTH, DEFAULT_SAMPLE_RATE,
    DEFAULT_STREAM_IP, DEFAULT_STREAM_PORT,
};
use pwar::{BackendKind, Session, SessionConfig};

#[derive(Parser, Debug)]
#[command(name = "pwar", version, about = "Low-latency audio relay over UDP")]
struct Cli {
    /// Audio backend: alsa, pipewire or simulated
    #[arg(short, long, default_value = "pipewire")]
    backend: BackendKind,

    /// Target IP address of the remote peer
    #[arg(short, long, default_value = DEFAULT_STREAM_IP)]
    ip: IpAddr,

    /// Target port of the remote peer
    #[arg(short, long, default_value_t = DEFAULT_STREAM_PORT)]
    port: u16,

    /// Device buffer size in frames per callback
    #[arg(long = "device-buffer", default_value_t = DEFAULT_BUFFER_FRAMES)]
    device_buffer: u32,

    /// Outbound packet size in frames, a multiple of the device buffer
    /// (defaults to the device buffer)
    #[arg(long = "packet-buffer")]
    packet_buffer: Option<u32>,

    /// Sample rate in Hz
    #[arg(short, long, default_value_t = DEFAULT_SAMPLE_RATE)]
    rate: u32,

    /// Ring buffer depth in frames
    #[arg(long = "ring-depth", default_value_t = DEFAULT_RING_DEPTH)]
    ring_depth: u32,

    /// Bypass the network and copy input straight to output
    #[arg(short = 't', long)]
    passthrough: bool,

    /// ALSA capture device
    #[arg(long = "capture-device", default_value = DEFAULT_PCM_DEVICE)]
    capture_device: String,

    /// ALSA playback device
    #[arg(long = "playback-device", default_value = DEFAULT_PCM_DEVICE)]
    playback_device: String,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if !audio::is_available(cli.backend) {
        let available: Vec<&str> = [BackendKind::Alsa, BackendKind::Pipewire, BackendKind::Simulated]
            .iter()
            .filter(|kind| audio::is_available(**kind))
            .map(|kind| kind.name())
            .collect();
        bail!(
            "backend {} is not available in this build (available: {})",
            cli.backend,
            available.join(", ")
        );
    }

    let config = SessionConfig {
        backend: cli.backend,
        stream_ip: cli.ip,
        stream_port: cli.port,
        listen_port: DEFAULT_STREAM_PORT,
        sample_rate: cli.rate,
        buffer_size: cli.device_buffer,
        packet_size: cli.packet_buffer.unwrap_or(cli.device_buffer),
        ring_depth: cli.ring_depth,
        passthrough_test: cli.passthrough,
        capture_device: cli.capture_device.clone(),
        playback_device: cli.playback_device.clone(),
    };

    tracing::info!("PWAR relay starting");
    tracing::info!("  target:        {}:{}", config.stream_ip, config.stream_port);
    tracing::info!("  backend:       {}", config.backend);
    tracing::info!(
        "  buffer:        {} frames ({:.2} ms)",
        config.buffer_size,
        config.buffer_size as f64 * 1000.0 / config.sample_rate as f64
    );
    tracing::info!("  sample rate:   {} Hz", config.sample_rate);
    tracing::info!("  ring depth:    {} frames", config.ring_depth);
    tracing::info!(
        "  passthrough:   {}",
        if config.passthrough_test { "enabled" } else { "disabled" }
    );
    if config.backend == BackendKind::Alsa {
        tracing::info!("  capture dev:   {}", config.capture_device);
        tracing::info!("  playback dev:  {}", config.playback_device);
    }

    let mut session = Session::init(config).context("failed to initialize session")?;
    session.start().context("failed to start audio backend")?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_handler = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_handler.store(true, Ordering::Relaxed);
    })
    .context("failed to install signal handler")?;

    tracing::info!("relay running, press Ctrl+C to stop");
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }

    tracing::info!("shutting down");
    session.stop().ok();
    session.shutdown();

    Ok(())
}
