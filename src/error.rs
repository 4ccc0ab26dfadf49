//! Error types for the PWAR relay

use thiserror::Error;

/// Main error type for the relay
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Ring buffer error: {0}")]
    Ring(#[from] RingBufferError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors, all raised before any resource is acquired
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("sample rate must be nonzero")]
    InvalidSampleRate,

    #[error("buffer size {0} outside supported chunk range {1}..={2}")]
    BufferSizeOutOfRange(u32, u32, u32),

    #[error("packet buffer {packet} is not a multiple of device buffer {device}")]
    PacketBufferNotMultiple { packet: u32, device: u32 },

    #[error("packet buffer {0} exceeds maximum chunk size {1}")]
    PacketBufferTooLarge(u32, u32),

    #[error("ring buffer depth {depth} is smaller than device buffer {buffer}")]
    RingDepthTooSmall { depth: u32, buffer: u32 },

    #[error("unknown backend: {0}")]
    UnknownBackend(String),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("backend {0} is not available in this build")]
    BackendUnavailable(&'static str),

    #[error("backend initialization failed: {0}")]
    InitFailed(String),

    #[error("failed to spawn audio thread: {0}")]
    ThreadSpawn(String),

    #[error("backend is already running")]
    AlreadyRunning,

    #[error("backend is not running")]
    NotRunning,

    #[error("ALSA error: {0}")]
    Alsa(String),

    #[error("PipeWire error: {0}")]
    Pipewire(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("socket bind failed: {0}")]
    BindFailed(String),

    #[error("socket configuration failed: {0}")]
    SocketConfig(String),

    #[error("failed to spawn receiver thread: {0}")]
    ReceiverSpawn(String),
}

/// Ring buffer errors, returned without mutating buffer state
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RingBufferError {
    #[error("ring buffer depth must be nonzero")]
    ZeroDepth,

    #[error("channel count must be nonzero")]
    ZeroChannels,

    #[error("channel count mismatch ({got} vs {expected})")]
    ChannelMismatch { got: usize, expected: usize },

    #[error("slice holds {got} samples, operation needs {need}")]
    ShortSlice { got: usize, need: usize },
}

/// Result type alias for the relay
pub type Result<T> = std::result::Result<T, Error>;
