//! Audio backend capability surface
//!
//! Backends expose a uniform start/stop/stats surface and call the process
//! callback with mono input and two non-interleaved output lanes. The
//! callback always receives exactly the configured number of frames, and
//! invocations never overlap for one backend instance.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::BackendKind;
use crate::error::AudioError;

/// Process callback invoked once per device buffer.
///
/// Arguments: mono input, left output, right output. All three slices have
/// the configured frame count.
pub type ProcessCallback = Box<dyn FnMut(&[f32], &mut [f32], &mut [f32]) + Send>;

/// Callback handle shared with the backend's real-time thread.
///
/// The lock is uncontended in steady state: the audio thread is the only
/// taker while the backend runs.
pub(crate) type SharedCallback = Arc<Mutex<ProcessCallback>>;

/// Device parameters handed to a backend at construction
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// ALSA playback device name; ignored by PipeWire and the simulator
    pub playback_device: String,
    /// ALSA capture device name; ignored by PipeWire and the simulator
    pub capture_device: String,
    pub sample_rate: u32,
    /// Buffer size in frames per process callback
    pub frames: u32,
    pub playback_channels: u32,
    pub capture_channels: u32,
}

/// Counters a backend accumulates while running
#[derive(Debug, Clone, Copy, Default)]
pub struct BackendStats {
    /// Completed process callbacks
    pub callbacks: u64,
    /// Capture-side hardware xruns (ALSA only)
    pub capture_xruns: u64,
    /// Playback-side hardware xruns (ALSA only)
    pub playback_xruns: u64,
    /// Output signal discontinuities detected by the simulated backend
    pub discontinuities: u64,
}

impl BackendStats {
    /// Total hardware xruns across both directions.
    pub fn xruns(&self) -> u64 {
        self.capture_xruns + self.playback_xruns
    }
}

/// Uniform capability set the relay core programs against
pub trait AudioBackend: Send {
    /// Begin invoking the process callback at the device cadence.
    fn start(&mut self) -> Result<(), AudioError>;

    /// Stop the device and join the audio thread.
    fn stop(&mut self) -> Result<(), AudioError>;

    fn is_running(&self) -> bool;

    fn stats(&self) -> BackendStats;

    /// Nominal one-way device latency in milliseconds.
    fn latency_ms(&self) -> f32;
}

/// Whether a backend variant was compiled into this build.
pub fn is_available(kind: BackendKind) -> bool {
    match kind {
        BackendKind::Alsa => cfg!(feature = "alsa"),
        BackendKind::Pipewire => cfg!(feature = "pipewire"),
        BackendKind::Simulated => true,
    }
}

/// Construct a backend of the requested kind.
pub fn create(
    kind: BackendKind,
    config: &AudioConfig,
    callback: ProcessCallback,
) -> Result<Box<dyn AudioBackend>, AudioError> {
    match kind {
        BackendKind::Simulated => Ok(Box::new(super::simulated::SimulatedBackend::new(
            config, callback,
        )?)),

        #[cfg(feature = "alsa")]
        BackendKind::Alsa => Ok(Box::new(super::alsa::AlsaBackend::new(config, callback)?)),
        #[cfg(not(feature = "alsa"))]
        BackendKind::Alsa => Err(AudioError::BackendUnavailable("alsa")),

        #[cfg(feature = "pipewire")]
        BackendKind::Pipewire => Ok(Box::new(super::pipewire::PipewireBackend::new(
            config, callback,
        )?)),
        #[cfg(not(feature = "pipewire"))]
        BackendKind::Pipewire => Err(AudioError::BackendUnavailable("pipewire")),
    }
}
