//! Wire format and the shared relay state it feeds
//!
//! The protocol layer is backend-agnostic: one fixed-size datagram per audio
//! chunk, a ring buffer decoupling the receiver from the audio callback, and
//! a latency manager aggregating the four-point timestamps every packet
//! carries.

pub mod latency;
pub mod packet;
pub mod ring_buffer;

pub use latency::{LatencyManager, LatencyMetrics};
pub use packet::{monotonic_ns, WirePacket, CHANNELS, MAX_CHUNK, MIN_CHUNK, WIRE_SIZE};
pub use ring_buffer::RingBuffer;
