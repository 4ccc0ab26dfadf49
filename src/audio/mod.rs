//! Audio backends
//!
//! A backend owns the device-facing side of the relay and drives the whole
//! pipeline by invoking the process callback at its buffer cadence. Three
//! variants exist: ALSA and PipeWire for hardware (each behind a cargo
//! feature, mirroring a build without the corresponding system library),
//! and a simulated backend that is always available for testing.

pub mod backend;
pub mod simulated;

#[cfg(feature = "alsa")]
pub mod alsa;

#[cfg(feature = "pipewire")]
pub mod pipewire;

pub use backend::{create, is_available, AudioBackend, AudioConfig, BackendStats, ProcessCallback};
pub use simulated::SimulatedBackend;
