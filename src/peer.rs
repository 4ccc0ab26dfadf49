//! Loopback peer
//!
//! Implements the remote end of the wire contract for testing without a
//! real peer: every received packet is stamped with t2 on arrival, echoed
//! unchanged, stamped with t3 just before the reply send, and returned to
//! the configured reply address. t1 is preserved so the relay can close
//! its round-trip measurement.

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytemuck::Zeroable;
use tracing::{debug, info, warn};

use crate::constants::{DEFAULT_PEER_PORT, DEFAULT_STREAM_PORT, RECV_TIMEOUT_MS};
use crate::error::{ConfigError, NetworkError, Result};
use crate::protocol::packet::{monotonic_ns, WirePacket, WIRE_SIZE};
use crate::rt;

/// Where the peer listens and where it sends replies
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Port packets from the relay arrive on
    pub listen_port: u16,
    /// Address replies are sent to, normally the relay's listen port
    pub reply_addr: SocketAddr,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PEER_PORT,
            reply_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_STREAM_PORT),
        }
    }
}

impl PeerConfig {
    /// Load overrides from a `key=value` file.
    ///
    /// Recognized keys: `server_ip`, `server_port`, `listen_port`. Blank
    /// lines and `#` comments are skipped; unknown keys are ignored so the
    /// file can be shared with other tools.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut config = Self::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "server_ip" => {
                    let ip: IpAddr = value.parse().map_err(|_| {
                        ConfigError::InvalidPort(format!("bad server_ip: {value}"))
                    })?;
                    config.reply_addr.set_ip(ip);
                }
                "server_port" => {
                    let port = parse_port(key, value)?;
                    config.reply_addr.set_port(port);
                }
                "listen_port" => {
                    config.listen_port = parse_port(key, value)?;
                }
                _ => {}
            }
        }

        Ok(config)
    }
}

fn parse_port(key: &str, value: &str) -> Result<u16> {
    let port: u16 = value
        .parse()
        .map_err(|_| ConfigError::InvalidPort(format!("bad {key}: {value}")))?;
    if port == 0 {
        return Err(ConfigError::InvalidPort(format!("{key} is 0")).into());
    }
    Ok(port)
}

/// Identity loopback peer running on its own thread
pub struct PeerLoopback {
    running: Arc<AtomicBool>,
    packets: Arc<AtomicU64>,
    thread: Option<JoinHandle<()>>,
}

impl PeerLoopback {
    /// Bind the peer sockets and start echoing.
    pub fn start(config: PeerConfig) -> Result<Self> {
        let recv_socket = UdpSocket::bind(("0.0.0.0", config.listen_port))
            .map_err(|e| NetworkError::BindFailed(format!("peer listen socket: {e}")))?;
        recv_socket
            .set_read_timeout(Some(Duration::from_millis(RECV_TIMEOUT_MS)))
            .map_err(|e| NetworkError::SocketConfig(format!("peer read timeout: {e}")))?;
        let send_socket = UdpSocket::bind(("0.0.0.0", 0))
            .map_err(|e| NetworkError::BindFailed(format!("peer send socket: {e}")))?;

        let running = Arc::new(AtomicBool::new(true));
        let packets = Arc::new(AtomicU64::new(0));

        let thread = {
            let running = running.clone();
            let packets = packets.clone();
            let reply_addr = config.reply_addr;
            thread::Builder::new()
                .name("pwar-peer".into())
                .spawn(move || echo_loop(recv_socket, send_socket, reply_addr, running, packets))
                .map_err(|e| NetworkError::ReceiverSpawn(e.to_string()))?
        };

        info!(
            listen_port = config.listen_port,
            reply = %config.reply_addr,
            "peer loopback started"
        );

        Ok(Self {
            running,
            packets,
            thread: Some(thread),
        })
    }

    /// Packets echoed since start.
    pub fn packets_processed(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Stop echoing and join the peer thread.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PeerLoopback {
    fn drop(&mut self) {
        self.stop();
    }
}

fn echo_loop(
    recv_socket: UdpSocket,
    send_socket: UdpSocket,
    reply_addr: SocketAddr,
    running: Arc<AtomicBool>,
    packets: Arc<AtomicU64>,
) {
    rt::promote_or_warn("peer loopback");

    let mut datagram = [0u8; WIRE_SIZE + 1];
    let mut packet = WirePacket::zeroed();

    while running.load(Ordering::Relaxed) {
        match recv_socket.recv(&mut datagram) {
            Ok(len) if len == WIRE_SIZE => {
                packet.as_bytes_mut().copy_from_slice(&datagram[..WIRE_SIZE]);
                packet.t2_remote_recv = monotonic_ns();

                // Identity processing: the audio goes back untouched.

                packet.t3_remote_send = monotonic_ns();
                if let Err(e) = send_socket.send_to(packet.as_bytes(), reply_addr) {
                    warn!("peer reply to {reply_addr} failed: {e}");
                }
                packets.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) => {}
            Err(e) => {
                if running.load(Ordering::Relaxed) {
                    warn!("peer receive error: {e}");
                }
            }
        }
    }

    debug!("peer loopback thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_file_overrides_defaults() {
        let dir = std::env::temp_dir();
        let path = dir.join("pwar_peer_config_test.cfg");
        {
            let mut file = fs::File::create(&path).unwrap();
            writeln!(file, "# relay target").unwrap();
            writeln!(file, "server_ip = 10.0.0.7").unwrap();
            writeln!(file, "server_port=9000").unwrap();
            writeln!(file).unwrap();
            writeln!(file, "listen_port = 9001").unwrap();
            writeln!(file, "unknown_key = whatever").unwrap();
        }

        let config = PeerConfig::from_file(&path).unwrap();
        fs::remove_file(&path).ok();

        assert_eq!(config.reply_addr, "10.0.0.7:9000".parse().unwrap());
        assert_eq!(config.listen_port, 9001);
    }

    #[test]
    fn config_file_rejects_bad_values() {
        let dir = std::env::temp_dir();
        let path = dir.join("pwar_peer_config_bad_test.cfg");
        fs::write(&path, "server_port = zero\n").unwrap();
        assert!(PeerConfig::from_file(&path).is_err());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn echoes_packets_with_t2_t3_stamped() {
        // Anchor the monotonic clock before the peer stamps anything.
        let _ = monotonic_ns();

        let relay = UdpSocket::bind("127.0.0.1:0").unwrap();
        relay
            .set_read_timeout(Some(Duration::from_millis(1000)))
            .unwrap();

        // Bind the peer on an ephemeral port by probing its socket first.
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer_port = probe.local_addr().unwrap().port();
        drop(probe);

        let mut peer = PeerLoopback::start(PeerConfig {
            listen_port: peer_port,
            reply_addr: relay.local_addr().unwrap(),
        })
        .unwrap();

        let mut outbound = WirePacket::from_mono(&vec![0.5f32; 64]);
        outbound.t1_local_send = 12345;
        relay
            .send_to(outbound.as_bytes(), ("127.0.0.1", peer_port))
            .unwrap();

        let mut reply = WirePacket::zeroed();
        let len = relay.recv(reply.as_bytes_mut()).unwrap();
        assert_eq!(len, WIRE_SIZE);

        assert_eq!(reply.t1_local_send, 12345);
        assert!(reply.t2_remote_recv > 0);
        assert!(reply.t3_remote_send >= reply.t2_remote_recv);
        assert_eq!(reply.n_samples, 64);
        assert_eq!(reply.payload(), outbound.payload());
        assert_eq!(peer.packets_processed(), 1);

        peer.stop();
    }
}
