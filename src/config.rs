//! Session configuration
//!
//! A [`SessionConfig`] is validated once at session init. Most fields can
//! only change across a full session restart; the few runtime-mutable ones
//! are applied in place by [`crate::Session::update_config`].

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use crate::constants::{
    DEFAULT_BUFFER_FRAMES, DEFAULT_PCM_DEVICE, DEFAULT_RING_DEPTH, DEFAULT_SAMPLE_RATE,
    DEFAULT_STREAM_ADDR, DEFAULT_STREAM_PORT,
};
use crate::error::ConfigError;
use crate::protocol::packet::{MAX_CHUNK, MIN_CHUNK};

/// Which audio backend drives the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Alsa,
    Pipewire,
    Simulated,
}

impl BackendKind {
    /// Stable lowercase name, used by the CLI and in log output
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Alsa => "alsa",
            BackendKind::Pipewire => "pipewire",
            BackendKind::Simulated => "simulated",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "alsa" => Ok(BackendKind::Alsa),
            "pipewire" => Ok(BackendKind::Pipewire),
            "simulated" => Ok(BackendKind::Simulated),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

/// Outcome of [`crate::Session::update_config`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigUpdate {
    /// All changed fields were runtime-mutable and are now in effect
    Applied,
    /// A restart-only field differs; the session must be rebuilt to apply it
    RestartRequired,
}

/// Full relay configuration
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Audio backend selection
    pub backend: BackendKind,
    /// Address of the remote peer
    pub stream_ip: IpAddr,
    /// Port of the remote peer
    pub stream_port: u16,
    /// Local port reply packets arrive on
    pub listen_port: u16,
    /// Sample rate shared by both ends
    pub sample_rate: u32,
    /// Device buffer size in frames per process callback
    pub buffer_size: u32,
    /// Outbound packet chunk size in frames, a multiple of `buffer_size`
    pub packet_size: u32,
    /// Ring buffer depth in frames
    pub ring_depth: u32,
    /// Bypass the network and copy input straight to output
    pub passthrough_test: bool,
    /// ALSA capture device (ignored by other backends)
    pub capture_device: String,
    /// ALSA playback device (ignored by other backends)
    pub playback_device: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Pipewire,
            stream_ip: DEFAULT_STREAM_ADDR,
            stream_port: DEFAULT_STREAM_PORT,
            listen_port: DEFAULT_STREAM_PORT,
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_FRAMES,
            packet_size: DEFAULT_BUFFER_FRAMES,
            ring_depth: DEFAULT_RING_DEPTH,
            passthrough_test: false,
            capture_device: DEFAULT_PCM_DEVICE.to_string(),
            playback_device: DEFAULT_PCM_DEVICE.to_string(),
        }
    }
}

impl SessionConfig {
    /// Check every invariant the rest of the relay relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stream_port == 0 {
            return Err(ConfigError::InvalidPort("stream port is 0".into()));
        }
        if self.listen_port == 0 {
            return Err(ConfigError::InvalidPort("listen port is 0".into()));
        }
        if self.sample_rate == 0 {
            return Err(ConfigError::InvalidSampleRate);
        }
        let (min, max) = (MIN_CHUNK as u32, MAX_CHUNK as u32);
        if self.buffer_size < min || self.buffer_size > max {
            return Err(ConfigError::BufferSizeOutOfRange(self.buffer_size, min, max));
        }
        if self.packet_size < self.buffer_size || self.packet_size % self.buffer_size != 0 {
            return Err(ConfigError::PacketBufferNotMultiple {
                packet: self.packet_size,
                device: self.buffer_size,
            });
        }
        if self.packet_size > max {
            return Err(ConfigError::PacketBufferTooLarge(self.packet_size, max));
        }
        if self.ring_depth < self.buffer_size {
            return Err(ConfigError::RingDepthTooSmall {
                depth: self.ring_depth,
                buffer: self.buffer_size,
            });
        }
        Ok(())
    }

    /// True when switching from `self` to `new` needs a full session rebuild.
    ///
    /// Only `passthrough_test` can be applied to a live session; everything
    /// else feeds into resources that are sized or bound at init.
    pub fn requires_restart(&self, new: &SessionConfig) -> bool {
        let mut live = new.clone();
        live.passthrough_test = self.passthrough_test;
        *self != live
    }
}
