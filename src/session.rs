//! Relay session: lifecycle and the per-callback relay core
//!
//! A [`Session`] is an owned handle over everything one relay needs:
//! sockets, ring buffer, latency manager, audio backend and receiver
//! thread. Resources are acquired in that order during [`Session::init`]
//! and released in reverse on shutdown; a failure mid-init drops the
//! prefix that already succeeded.
//!
//! The audio path never fails upward. Inside the process callback the only
//! blocking synchronization is the ring-buffer mutex, held for one pop.

use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::audio::backend::{self, AudioBackend, AudioConfig, ProcessCallback};
use crate::config::{ConfigUpdate, SessionConfig};
use crate::error::{AudioError, NetworkError, Result};
use crate::network::{self, receiver};
use crate::protocol::latency::{LatencyManager, LatencyMetrics};
use crate::protocol::packet::{monotonic_ns, WirePacket, CHANNELS, MAX_CHUNK};
use crate::protocol::ring_buffer::RingBuffer;

/// Owned handle over one running relay
pub struct Session {
    config: SessionConfig,
    ring: Arc<RingBuffer>,
    latency: Arc<LatencyManager>,
    backend: Box<dyn AudioBackend>,
    receiver: Option<JoinHandle<()>>,
    should_stop: Arc<AtomicBool>,
    passthrough: Arc<AtomicBool>,
    peer_buffer_size: Arc<AtomicU32>,
    send_failures: Arc<AtomicU64>,
    running: bool,
}

impl Session {
    /// Build a session: sockets, ring buffer, backend, latency manager,
    /// receiver thread. Fails without leaking partial state.
    pub fn init(config: SessionConfig) -> Result<Session> {
        config.validate()?;
        if !backend::is_available(config.backend) {
            return Err(AudioError::BackendUnavailable(config.backend.name()).into());
        }

        let send_socket = network::bind_send_socket()?;
        let recv_socket = network::bind_recv_socket(config.listen_port)?;
        let peer_addr = SocketAddr::new(config.stream_ip, config.stream_port);

        let ring = Arc::new(RingBuffer::new(
            config.ring_depth as usize,
            CHANNELS,
            config.buffer_size as usize,
        )?);

        let should_stop = Arc::new(AtomicBool::new(false));
        let passthrough = Arc::new(AtomicBool::new(config.passthrough_test));
        let peer_buffer_size = Arc::new(AtomicU32::new(0));
        let send_failures = Arc::new(AtomicU64::new(0));

        let callback = relay_callback(
            send_socket,
            peer_addr,
            ring.clone(),
            passthrough.clone(),
            send_failures.clone(),
        );
        let audio_config = AudioConfig {
            playback_device: config.playback_device.clone(),
            capture_device: config.capture_device.clone(),
            sample_rate: config.sample_rate,
            frames: config.buffer_size,
            playback_channels: CHANNELS as u32,
            capture_channels: CHANNELS as u32,
        };
        let backend = backend::create(config.backend, &audio_config, callback)?;

        let latency = Arc::new(LatencyManager::new(
            config.sample_rate,
            config.buffer_size,
            backend.latency_ms(),
        ));

        let receiver = receiver::spawn(
            recv_socket,
            ring.clone(),
            latency.clone(),
            should_stop.clone(),
            peer_buffer_size.clone(),
        )
        .map_err(|e| NetworkError::ReceiverSpawn(e.to_string()))?;

        info!(
            backend = %config.backend,
            peer = %peer_addr,
            listen_port = config.listen_port,
            buffer = config.buffer_size,
            ring_depth = config.ring_depth,
            "session initialized"
        );

        Ok(Session {
            config,
            ring,
            latency,
            backend,
            receiver: Some(receiver),
            should_stop,
            passthrough,
            peer_buffer_size,
            send_failures,
            running: false,
        })
    }

    /// Begin audio processing.
    pub fn start(&mut self) -> Result<()> {
        if self.running {
            return Err(AudioError::AlreadyRunning.into());
        }
        self.backend.start()?;
        self.running = true;
        info!("session started");
        Ok(())
    }

    /// Stop audio processing; the session stays initialized and can be
    /// started again.
    pub fn stop(&mut self) -> Result<()> {
        if !self.running {
            return Err(AudioError::NotRunning.into());
        }
        self.backend.stop()?;
        self.running = false;
        info!("session stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Apply a new configuration to the live session.
    ///
    /// Only runtime-mutable fields can change in place; any other
    /// difference requires tearing the session down and rebuilding it.
    pub fn update_config(&mut self, new: &SessionConfig) -> Result<ConfigUpdate> {
        new.validate()?;
        if self.config.requires_restart(new) {
            return Ok(ConfigUpdate::RestartRequired);
        }
        self.passthrough
            .store(new.passthrough_test, Ordering::Relaxed);
        self.config.passthrough_test = new.passthrough_test;
        Ok(ConfigUpdate::Applied)
    }

    /// Latest two-second latency snapshot, with hardware xruns folded in.
    pub fn latency_metrics(&self) -> LatencyMetrics {
        let mut metrics = self.latency.current_metrics();
        metrics.xruns = self.backend.stats().xruns();
        metrics
    }

    /// Chunk size of the most recent reply packet, 0 before the first one.
    pub fn current_peer_buffer_size(&self) -> u32 {
        self.peer_buffer_size.load(Ordering::Relaxed)
    }

    /// Ring-buffer overrun events so far.
    pub fn ring_overruns(&self) -> u32 {
        self.ring.overruns()
    }

    /// Ring-buffer underrun events so far.
    pub fn ring_underruns(&self) -> u32 {
        self.ring.underruns()
    }

    /// Outbound packets the relay failed to hand to the OS so far.
    pub fn send_failures(&self) -> u64 {
        self.send_failures.load(Ordering::Relaxed)
    }

    /// Tear the session down explicitly. Equivalent to dropping it.
    pub fn shutdown(self) {}

    fn teardown(&mut self) {
        if self.running {
            if let Err(e) = self.backend.stop() {
                warn!("backend stop failed during teardown: {e}");
            }
            self.running = false;
        }

        self.should_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.receiver.take() {
            let _ = handle.join();
        }

        let stats = self.backend.stats();
        info!(
            callbacks = stats.callbacks,
            xruns = stats.xruns(),
            ring_overruns = self.ring.overruns(),
            ring_underruns = self.ring.underruns(),
            send_failures = self.send_failures.load(Ordering::Relaxed),
            "session shut down"
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Build the process callback for one session.
///
/// Per invocation: pack the mono input into both stereo lanes, stamp t1,
/// send to the peer, then pop one buffer from the ring and deinterleave it
/// into the output lanes. In passthrough mode the network is bypassed and
/// input is copied straight to both outputs.
fn relay_callback(
    socket: UdpSocket,
    peer_addr: SocketAddr,
    ring: Arc<RingBuffer>,
    passthrough: Arc<AtomicBool>,
    send_failures: Arc<AtomicU64>,
) -> ProcessCallback {
    let mut packet = WirePacket::from_mono(&[]);
    let mut received = vec![0.0f32; CHANNELS * MAX_CHUNK];

    Box::new(move |input, out_left, out_right| {
        let frames = input.len().min(MAX_CHUNK);

        if passthrough.load(Ordering::Relaxed) {
            out_left[..frames].copy_from_slice(&input[..frames]);
            out_right[..frames].copy_from_slice(&input[..frames]);
            return;
        }

        packet.set_mono_payload(&input[..frames]);
        packet.t1_local_send = monotonic_ns();
        if let Err(e) = socket.send_to(packet.as_bytes(), peer_addr) {
            send_failures.fetch_add(1, Ordering::Relaxed);
            warn!("failed to send audio packet to {peer_addr}: {e}");
        }

        let received = &mut received[..frames * CHANNELS];
        let _ = ring.pop(received, frames, CHANNELS);
        for i in 0..frames {
            out_left[i] = received[i * CHANNELS];
            out_right[i] = received[i * CHANNELS + 1];
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use std::thread;
    use std::time::Duration;

    fn test_config(listen_port: u16, stream_port: u16) -> SessionConfig {
        SessionConfig {
            backend: BackendKind::Simulated,
            stream_ip: "127.0.0.1".parse().unwrap(),
            stream_port,
            listen_port,
            buffer_size: 64,
            packet_size: 64,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn lifecycle_walks_the_state_machine() {
        let mut session = Session::init(test_config(40311, 40312)).unwrap();
        assert!(!session.is_running());
        assert!(session.stop().is_err());

        session.start().unwrap();
        assert!(session.is_running());
        assert!(session.start().is_err());

        session.stop().unwrap();
        assert!(!session.is_running());

        // init -> running -> initialized -> running again
        session.start().unwrap();
        thread::sleep(Duration::from_millis(50));
        session.stop().unwrap();
        session.shutdown();
    }

    #[test]
    fn init_rejects_invalid_config() {
        let mut config = test_config(40321, 40322);
        config.buffer_size = 7;
        assert!(Session::init(config).is_err());
    }

    #[test]
    fn update_config_distinguishes_runtime_fields() {
        let mut session = Session::init(test_config(40331, 40332)).unwrap();

        let mut new = test_config(40331, 40332);
        new.passthrough_test = true;
        assert_eq!(
            session.update_config(&new).unwrap(),
            ConfigUpdate::Applied
        );
        assert!(session.config().passthrough_test);

        // Applying the same runtime-mutable fields again is a no-op.
        assert_eq!(
            session.update_config(&new).unwrap(),
            ConfigUpdate::Applied
        );
        assert!(session.config().passthrough_test);

        let mut restart = test_config(40331, 40332);
        restart.ring_depth = 2048;
        assert_eq!(
            session.update_config(&restart).unwrap(),
            ConfigUpdate::RestartRequired
        );
        // The live config is untouched by a rejected update.
        assert_eq!(session.config().ring_depth, 1024);
    }

    #[test]
    fn passthrough_copies_input_to_both_lanes() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = socket.local_addr().unwrap();
        let ring = Arc::new(RingBuffer::new(256, CHANNELS, 64).unwrap());
        let passthrough = Arc::new(AtomicBool::new(true));
        let mut callback = relay_callback(
            socket,
            peer,
            ring.clone(),
            passthrough,
            Arc::new(AtomicU64::new(0)),
        );

        let input: Vec<f32> = (0..64).map(|i| i as f32).collect();
        let mut left = vec![0.0; 64];
        let mut right = vec![0.0; 64];
        callback(&input, &mut left, &mut right);

        assert_eq!(left, input);
        assert_eq!(right, input);
        // Passthrough does not touch the ring.
        assert_eq!(ring.available(), 256);
    }

    #[test]
    fn relay_pops_ring_audio_into_the_outputs() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let peer = socket.local_addr().unwrap();
        let ring = Arc::new(RingBuffer::new(256, CHANNELS, 64).unwrap());
        let passthrough = Arc::new(AtomicBool::new(false));
        let send_failures = Arc::new(AtomicU64::new(0));
        let mut callback = relay_callback(
            socket,
            peer,
            ring.clone(),
            passthrough,
            send_failures.clone(),
        );

        // Drain the prefill, then stage one known buffer.
        let mut sink = vec![0.0; 256 * CHANNELS];
        ring.pop(&mut sink, 256, CHANNELS).unwrap();
        let mut staged = Vec::new();
        for i in 0..64 {
            staged.push(i as f32);
            staged.push(-(i as f32));
        }
        ring.push(&staged, 64, CHANNELS).unwrap();

        let input = vec![0.1f32; 64];
        let mut left = vec![0.0; 64];
        let mut right = vec![0.0; 64];
        callback(&input, &mut left, &mut right);

        for i in 0..64 {
            assert_eq!(left[i], i as f32);
            assert_eq!(right[i], -(i as f32));
        }
        assert_eq!(ring.available(), 0);
        assert_eq!(send_failures.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn failed_sends_are_counted() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        // Port 0 is not a valid destination, so every send fails.
        let peer: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let ring = Arc::new(RingBuffer::new(256, CHANNELS, 64).unwrap());
        let passthrough = Arc::new(AtomicBool::new(false));
        let send_failures = Arc::new(AtomicU64::new(0));
        let mut callback = relay_callback(
            socket,
            peer,
            ring.clone(),
            passthrough,
            send_failures.clone(),
        );

        let input = vec![0.1f32; 64];
        let mut left = vec![0.0; 64];
        let mut right = vec![0.0; 64];
        callback(&input, &mut left, &mut right);
        callback(&input, &mut left, &mut right);

        assert_eq!(send_failures.load(Ordering::Relaxed), 2);
        // The callback still serves output from the ring despite the errors.
        assert_eq!(ring.available(), 128);
    }
}
