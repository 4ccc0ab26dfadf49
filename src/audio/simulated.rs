//! Simulated audio backend
//!
//! Drives the relay without hardware: a real-time thread synthesizes a low
//! frequency sine as capture input, invokes the process callback at the
//! exact buffer cadence, and checks that the output lane echoes a delayed
//! copy of the input. Zero crossings give a coarse round-trip estimate;
//! comparing every output sample against the expected sine value counts
//! discontinuities (dropouts, resets, reordered audio).

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::audio::backend::{AudioBackend, AudioConfig, BackendStats, ProcessCallback, SharedCallback};
use crate::error::AudioError;
use crate::protocol::packet::monotonic_ns;
use crate::rt;

/// Test signal frequency. At 10 Hz the zero crossings are ~100 ms apart,
/// comfortably wider than the 0.8–30 ms latencies being measured.
const TEST_SIGNAL_HZ: f64 = 10.0;
const TEST_SIGNAL_AMPLITUDE: f64 = 0.3;
/// Acceptable deviation between an output sample and the expected sine.
const DISCONTINUITY_EPSILON: f32 = 1e-4;

#[derive(Default)]
struct SharedStats {
    callbacks: AtomicU64,
    discontinuities: AtomicU64,
}

/// Hardware-free backend used by tests and protocol bring-up
pub struct SimulatedBackend {
    sample_rate: u32,
    frames: u32,
    callback: SharedCallback,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    stats: Arc<SharedStats>,
}

impl SimulatedBackend {
    pub fn new(config: &AudioConfig, callback: ProcessCallback) -> Result<Self, AudioError> {
        if config.sample_rate == 0 || config.frames == 0 {
            return Err(AudioError::InitFailed(
                "simulated backend needs a nonzero sample rate and buffer size".into(),
            ));
        }

        Ok(Self {
            sample_rate: config.sample_rate,
            frames: config.frames,
            callback: Arc::new(Mutex::new(callback)),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            stats: Arc::new(SharedStats::default()),
        })
    }
}

impl AudioBackend for SimulatedBackend {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyRunning);
        }

        self.running.store(true, Ordering::SeqCst);
        let running = self.running.clone();
        let callback = self.callback.clone();
        let stats = self.stats.clone();
        let sample_rate = self.sample_rate;
        let frames = self.frames;

        let handle = thread::Builder::new()
            .name("pwar-sim-audio".into())
            .spawn(move || run_simulation(sample_rate, frames, callback, running, stats))
            .map_err(|e| {
                self.running.store(false, Ordering::SeqCst);
                AudioError::ThreadSpawn(e.to_string())
            })?;

        self.thread = Some(handle);
        info!("simulated backend started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AudioError::NotRunning);
        }

        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        info!("simulated backend stopped");
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            callbacks: self.stats.callbacks.load(Ordering::Relaxed),
            capture_xruns: 0,
            playback_xruns: 0,
            discontinuities: self.stats.discontinuities.load(Ordering::Relaxed),
        }
    }

    fn latency_ms(&self) -> f32 {
        self.frames as f32 / self.sample_rate as f32 * 1000.0
    }
}

impl Drop for SimulatedBackend {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// Loopback signal analysis carried across callbacks
struct Analysis {
    sample_rate: u32,
    last_input_sample: f32,
    last_output_sample: f32,
    output_phase: f64,
    last_input_zero_cross: u64,
    rtt_min_ms: f32,
    rtt_max_ms: f32,
    rtt_sum_ms: f64,
    rtt_count: u32,
    discontinuities: u32,
}

impl Analysis {
    fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            last_input_sample: 0.0,
            last_output_sample: 0.0,
            output_phase: 0.0,
            last_input_zero_cross: 0,
            rtt_min_ms: 0.0,
            rtt_max_ms: 0.0,
            rtt_sum_ms: 0.0,
            rtt_count: 0,
            discontinuities: 0,
        }
    }

    fn inspect(&mut self, input: &[f32], output_left: &[f32]) {
        for (&in_sample, &out_sample) in input.iter().zip(output_left) {
            if in_sample >= 0.0 && self.last_input_sample < 0.0 {
                self.last_input_zero_cross = monotonic_ns();
            }
            if out_sample >= 0.0 && self.last_output_sample < 0.0 {
                // The output crossing re-anchors the reference sine and
                // closes one round-trip measurement.
                self.output_phase = 0.0;
                let rtt_ms = monotonic_ns().saturating_sub(self.last_input_zero_cross) as f32
                    / 1_000_000.0;
                if self.rtt_count == 0 {
                    self.rtt_min_ms = rtt_ms;
                    self.rtt_max_ms = rtt_ms;
                    self.rtt_sum_ms = rtt_ms as f64;
                } else {
                    self.rtt_min_ms = self.rtt_min_ms.min(rtt_ms);
                    self.rtt_max_ms = self.rtt_max_ms.max(rtt_ms);
                    self.rtt_sum_ms += rtt_ms as f64;
                }
                self.rtt_count += 1;
            }

            let expected =
                (TEST_SIGNAL_AMPLITUDE * (TAU * self.output_phase).sin()) as f32;
            if (out_sample - expected).abs() > DISCONTINUITY_EPSILON {
                self.discontinuities += 1;
            }
            self.output_phase += TEST_SIGNAL_HZ / self.sample_rate as f64;
            if self.output_phase >= 1.0 {
                self.output_phase -= 1.0;
            }

            self.last_input_sample = in_sample;
            self.last_output_sample = out_sample;
        }
    }

    fn report_and_reset(&mut self, stats: &SharedStats) {
        let rtt_avg_ms = if self.rtt_count > 0 {
            (self.rtt_sum_ms / self.rtt_count as f64) as f32
        } else {
            0.0
        };
        info!(
            "simulated loopback RTT: min={:.3}ms max={:.3}ms avg={:.3}ms",
            self.rtt_min_ms, self.rtt_max_ms, rtt_avg_ms
        );
        if self.discontinuities > 0 {
            error!(
                count = self.discontinuities,
                "discontinuities detected in output signal over last window"
            );
            stats
                .discontinuities
                .fetch_add(self.discontinuities as u64, Ordering::Relaxed);
        }

        self.rtt_min_ms = 0.0;
        self.rtt_max_ms = 0.0;
        self.rtt_sum_ms = 0.0;
        self.rtt_count = 0;
        self.discontinuities = 0;
    }
}

fn run_simulation(
    sample_rate: u32,
    frames: u32,
    callback: SharedCallback,
    running: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
) {
    rt::promote_or_warn("simulated audio");

    let frames = frames as usize;
    let frame_time_ns = frames as u64 * 1_000_000_000 / sample_rate as u64;
    let buffer_interval = Duration::from_nanos(frame_time_ns);

    info!(
        sample_rate,
        frames,
        interval_ms = frame_time_ns as f64 / 1_000_000.0,
        signal_hz = TEST_SIGNAL_HZ,
        "starting audio simulation thread"
    );

    let mut input = vec![0.0f32; frames];
    let mut output_left = vec![0.0f32; frames];
    let mut output_right = vec![0.0f32; frames];
    let mut phase = 0.0f64;
    let mut analysis = Analysis::new(sample_rate);
    let mut total_callbacks = 0u64;

    // Two wall-clock seconds worth of callbacks per analysis window.
    let callbacks_per_window = (2 * sample_rate as u64 / frames as u64).max(1);

    while running.load(Ordering::Relaxed) {
        for sample in input.iter_mut() {
            *sample = (TEST_SIGNAL_AMPLITUDE * (TAU * phase).sin()) as f32;
            phase += TEST_SIGNAL_HZ / sample_rate as f64;
            if phase >= 1.0 {
                phase -= 1.0;
            }
        }

        (*callback.lock())(&input, &mut output_left, &mut output_right);

        total_callbacks += 1;
        stats.callbacks.fetch_add(1, Ordering::Relaxed);

        analysis.inspect(&input, &output_left);
        if total_callbacks % callbacks_per_window == 0 {
            analysis.report_and_reset(&stats);
        }

        thread::sleep(buffer_interval);
    }

    info!("audio simulation thread stopped");
}
