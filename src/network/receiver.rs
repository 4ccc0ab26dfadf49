//! Real-time UDP receiver task
//!
//! A dedicated thread owns the receive socket and is the sole producer to
//! the ring buffer. Each reply datagram of exactly the wire-packet size is
//! stamped with t4, fed to the latency manager, and its payload pushed into
//! the ring; anything else is dropped silently. The short socket timeout is
//! what lets the task observe the stop flag during quiet periods.

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytemuck::Zeroable;
use tracing::{debug, warn};

use crate::protocol::latency::LatencyManager;
use crate::protocol::packet::{WirePacket, CHANNELS, WIRE_SIZE};
use crate::protocol::ring_buffer::RingBuffer;
use crate::rt;

/// Spawn the receiver thread for a session.
pub fn spawn(
    socket: UdpSocket,
    ring: Arc<RingBuffer>,
    latency: Arc<LatencyManager>,
    should_stop: Arc<AtomicBool>,
    peer_buffer_size: Arc<AtomicU32>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("pwar-receiver".into())
        .spawn(move || receive_loop(socket, ring, latency, should_stop, peer_buffer_size))
}

fn receive_loop(
    socket: UdpSocket,
    ring: Arc<RingBuffer>,
    latency: Arc<LatencyManager>,
    should_stop: Arc<AtomicBool>,
    peer_buffer_size: Arc<AtomicU32>,
) {
    rt::promote_or_warn("receiver");
    debug!("receiver thread started");

    // One spare byte so an oversized datagram cannot masquerade as a
    // well-sized one after kernel truncation.
    let mut datagram = [0u8; WIRE_SIZE + 1];
    let mut packet = WirePacket::zeroed();

    while !should_stop.load(Ordering::Relaxed) {
        match socket.recv(&mut datagram) {
            Ok(len) if len == WIRE_SIZE => {
                packet.as_bytes_mut().copy_from_slice(&datagram[..WIRE_SIZE]);
                if !packet.valid_for_relay() {
                    continue;
                }

                latency.process_packet(&mut packet);
                peer_buffer_size.store(packet.n_samples as u32, Ordering::Relaxed);

                if ring.push(packet.payload(), packet.frames(), CHANNELS).is_ok() {
                    latency.report_ring_buffer_fill(ring.available());
                }
            }
            // Undersized or oversized datagram: not ours, drop silently.
            Ok(_) => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {}
            Err(e) => {
                if !should_stop.load(Ordering::Relaxed) {
                    warn!("receive error: {e}");
                }
            }
        }
    }

    debug!("receiver thread stopped");
}
