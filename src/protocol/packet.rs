//! PWAR wire packet
//!
//! One UDP datagram carries one audio chunk plus the four timestamps of the
//! round trip: t1 stamped just before the local send, t2/t3 stamped by the
//! peer around its processing, t4 stamped on local receive. Timestamps are
//! monotonic nanoseconds of whichever host wrote them and are only ever
//! differenced on the host that produced both ends of the delta.
//!
//! The record is always transmitted at its full size; slots past
//! `n_samples` frames are ignored by the receiver.

use std::mem;
use std::sync::OnceLock;
use std::time::Instant;

use bytemuck::{Pod, Zeroable};

/// Largest chunk a packet can carry, in frames
pub const MAX_CHUNK: usize = 128;
/// Smallest chunk accepted for relay, in frames
pub const MIN_CHUNK: usize = 32;
/// Channel count of the interleaved payload
pub const CHANNELS: usize = 2;

/// On-wire audio packet, sent verbatim as a single datagram
#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
pub struct WirePacket {
    /// Frames carried in this packet, MIN_CHUNK..=MAX_CHUNK
    pub n_samples: u16,
    _pad: [u8; 6],

    /// Stamped by the local relay just before the outbound send
    pub t1_local_send: u64,
    /// Stamped by the peer on receive
    pub t2_remote_recv: u64,
    /// Stamped by the peer just before its reply send
    pub t3_remote_send: u64,
    /// Stamped by the local receiver on reply receive
    pub t4_local_recv: u64,

    /// Interleaved f32 PCM; only the first `n_samples * CHANNELS` are defined
    pub samples: [f32; CHANNELS * MAX_CHUNK],
}

/// Exact datagram size of a wire packet
pub const WIRE_SIZE: usize = mem::size_of::<WirePacket>();
const _: () = assert!(WIRE_SIZE == 8 + 4 * 8 + CHANNELS * MAX_CHUNK * 4);

impl WirePacket {
    /// Build an outbound packet from mono input, duplicated into both
    /// stereo lanes. `input` longer than [`MAX_CHUNK`] is truncated.
    pub fn from_mono(input: &[f32]) -> Self {
        let mut packet = Self::zeroed();
        packet.set_mono_payload(input);
        packet
    }

    /// Overwrite the payload of an existing packet, reusing its storage.
    pub fn set_mono_payload(&mut self, input: &[f32]) {
        let frames = input.len().min(MAX_CHUNK);
        self.n_samples = frames as u16;
        for (i, &sample) in input[..frames].iter().enumerate() {
            self.samples[i * CHANNELS] = sample;
            self.samples[i * CHANNELS + 1] = sample;
        }
    }

    /// Frames carried by this packet, clamped to the payload capacity.
    pub fn frames(&self) -> usize {
        (self.n_samples as usize).min(MAX_CHUNK)
    }

    /// The defined portion of the interleaved payload.
    pub fn payload(&self) -> &[f32] {
        &self.samples[..self.frames() * CHANNELS]
    }

    /// A packet is valid for relay iff its chunk size is within bounds.
    /// The size check happens at the datagram level before this is called.
    pub fn valid_for_relay(&self) -> bool {
        let n = self.n_samples as usize;
        (MIN_CHUNK..=MAX_CHUNK).contains(&n)
    }

    /// Borrow the packet as raw datagram bytes.
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Borrow the packet as a mutable receive target.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::bytes_of_mut(self)
    }
}

static CLOCK_ANCHOR: OnceLock<Instant> = OnceLock::new();

/// Monotonic timestamp in nanoseconds.
///
/// Anchored at first use, so values are comparable within one process but
/// never across hosts. Both ends of the protocol only difference their own
/// stamps, which is all the latency manager needs.
pub fn monotonic_ns() -> u64 {
    let anchor = CLOCK_ANCHOR.get_or_init(Instant::now);
    anchor.elapsed().as_nanos() as u64
}
