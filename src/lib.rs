//! # PWAR — PipeWire ASIO Relay
//!
//! Low-latency bidirectional PCM audio bridge between a Linux host and a
//! remote peer over UDP. The Linux side captures audio from a local backend
//! (PipeWire, ALSA, or a simulated device), ships it to the peer for
//! processing, and plays back whatever the peer returns, with round-trip
//! delays on the order of a few audio buffer periods.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                            LINUX HOST                                │
//! │                                                                      │
//! │  ┌───────────────────────┐                 ┌──────────────────────┐  │
//! │  │ Audio backend (audio) │                 │ Receiver (network)   │  │
//! │  │ ALSA / PipeWire / Sim │                 │ SCHED_FIFO thread    │  │
//! │  └──────────┬────────────┘                 └──────────┬───────────┘  │
//! │             │ process callback                        │ recvfrom     │
//! │             ▼                                         ▼              │
//! │  ┌───────────────────────┐   pop          ┌──────────────────────┐  │
//! │  │ Relay core (session)  │◄───────────────┤ Ring buffer          │  │
//! │  │ pack + t1 + sendto    │                │ (protocol::ring)     │  │
//! │  └──────────┬────────────┘                └──────────▲───────────┘  │
//! │             │                                        │ push         │
//! │             │              ┌─────────────────────────┴───────────┐  │
//! │             │              │ Latency manager (protocol::latency) │  │
//! │             │              │ rtt / proc / jitter / fill windows  │  │
//! │             │              └─────────────────────────────────────┘  │
//! └─────────────┼────────────────────────────────────────▲─────────────┘
//!               │ UDP: one wire packet per audio chunk   │
//!               ▼                                        │
//! ┌──────────────────────────────────────────────────────┴──────────────┐
//! │                            REMOTE PEER                              │
//! │         stamp t2 ── process (identity for the simulator) ── t3      │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The ring buffer is the only state shared between the two real-time
//! actors: the receiver task is its sole producer, the audio callback its
//! sole consumer.

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod peer;
pub mod protocol;
pub mod rt;
pub mod session;

pub use config::{BackendKind, ConfigUpdate, SessionConfig};
pub use error::{Error, Result};
pub use peer::{PeerConfig, PeerLoopback};
pub use protocol::latency::{LatencyManager, LatencyMetrics};
pub use protocol::packet::WirePacket;
pub use protocol::ring_buffer::RingBuffer;
pub use session::Session;

/// Application-wide constants
pub mod constants {
    use std::net::{IpAddr, Ipv4Addr};

    /// Default sample rate for the relay
    pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;

    /// Default device buffer size in frames per callback
    pub const DEFAULT_BUFFER_FRAMES: u32 = 32;

    /// Default ring buffer depth in frames
    pub const DEFAULT_RING_DEPTH: u32 = 1024;

    /// Default UDP port the relay listens on and the peer replies to
    pub const DEFAULT_STREAM_PORT: u16 = 8321;

    /// Default UDP port a same-host loopback peer listens on
    pub const DEFAULT_PEER_PORT: u16 = 8322;

    /// Default target address of the remote peer
    pub const DEFAULT_STREAM_IP: &str = "192.168.66.3";

    /// [`DEFAULT_STREAM_IP`] as a typed address
    pub const DEFAULT_STREAM_ADDR: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 66, 3));

    /// Default ALSA device for capture and playback
    pub const DEFAULT_PCM_DEVICE: &str = "hw:3,0";

    /// OS receive buffer for the reply socket, sized to absorb peer bursts
    pub const RECV_SOCKET_BUFFER_BYTES: usize = 1024 * 1024;

    /// Receive timeout, bounds how long shutdown waits on the receiver
    pub const RECV_TIMEOUT_MS: u64 = 100;
}
