//! ALSA audio backend
//!
//! A dedicated real-time thread runs the classic blocking loop: read one
//! period from the capture device, invoke the process callback, write one
//! period to the playback device. An EPIPE/ESTRPIPE from either direction
//! re-prepares that stream, counts an xrun and abandons the iteration.
//!
//! Devices are opened S32 interleaved with a two-period hardware buffer;
//! the start threshold and wakeup minimum are one period.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use alsa::pcm::{Access, Format, Frames, HwParams, PCM};
use alsa::{Direction, ValueOr};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::audio::backend::{AudioBackend, AudioConfig, BackendStats, ProcessCallback, SharedCallback};
use crate::error::AudioError;
use crate::rt;

const I32_SCALE: f32 = 2_147_483_648.0;

#[derive(Default)]
struct SharedStats {
    iterations: AtomicU64,
    capture_xruns: AtomicU64,
    playback_xruns: AtomicU64,
}

/// Backend driving a pair of ALSA PCM devices from one blocking loop
pub struct AlsaBackend {
    config: AudioConfig,
    callback: SharedCallback,
    /// Present while the audio thread is not running
    pcms: Option<(PCM, PCM)>,
    thread: Option<JoinHandle<(PCM, PCM)>>,
    should_stop: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    latency_ms: f32,
}

impl AlsaBackend {
    pub fn new(config: &AudioConfig, callback: ProcessCallback) -> Result<Self, AudioError> {
        let (playback, playback_latency) = setup_pcm(
            &config.playback_device,
            Direction::Playback,
            config.sample_rate,
            config.playback_channels,
            config.frames,
        )?;
        let (capture, capture_latency) = setup_pcm(
            &config.capture_device,
            Direction::Capture,
            config.sample_rate,
            config.capture_channels,
            config.frames,
        )?;

        Ok(Self {
            config: config.clone(),
            callback: Arc::new(Mutex::new(callback)),
            pcms: Some((playback, capture)),
            thread: None,
            should_stop: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(SharedStats::default()),
            latency_ms: playback_latency + capture_latency,
        })
    }
}

impl AudioBackend for AlsaBackend {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyRunning);
        }
        let (playback, capture) = self
            .pcms
            .take()
            .ok_or_else(|| AudioError::InitFailed("PCM devices were lost".into()))?;

        self.should_stop.store(false, Ordering::SeqCst);
        let should_stop = self.should_stop.clone();
        let callback = self.callback.clone();
        let stats = self.stats.clone();
        let config = self.config.clone();

        let handle = thread::Builder::new()
            .name("pwar-alsa-audio".into())
            .spawn(move || audio_loop(playback, capture, config, callback, should_stop, stats))
            .map_err(|e| AudioError::ThreadSpawn(e.to_string()))?;

        self.thread = Some(handle);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AudioError::NotRunning);
        }
        self.should_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            if let Ok(pcms) = handle.join() {
                self.pcms = Some(pcms);
            }
        }
        self.running.store(false, Ordering::SeqCst);

        let stats = self.stats();
        info!(
            iterations = stats.callbacks,
            capture_xruns = stats.capture_xruns,
            playback_xruns = stats.playback_xruns,
            "ALSA backend stopped"
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            callbacks: self.stats.iterations.load(Ordering::Relaxed),
            capture_xruns: self.stats.capture_xruns.load(Ordering::Relaxed),
            playback_xruns: self.stats.playback_xruns.load(Ordering::Relaxed),
            // No signal-level discontinuity detector here; only the
            // simulated backend analyzes its loopback output.
            discontinuities: 0,
        }
    }

    /// Capture plus playback hardware buffer time.
    fn latency_ms(&self) -> f32 {
        self.latency_ms
    }
}

impl Drop for AlsaBackend {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

fn setup_pcm(
    device: &str,
    direction: Direction,
    rate: u32,
    channels: u32,
    period: u32,
) -> Result<(PCM, f32), AudioError> {
    let label = match direction {
        Direction::Playback => "playback",
        Direction::Capture => "capture",
    };
    let map_err = |stage: &'static str| {
        let device = device.to_string();
        move |e: alsa::Error| AudioError::Alsa(format!("{device} {label} {stage}: {e}"))
    };

    let pcm = PCM::new(device, direction, false).map_err(map_err("open"))?;

    {
        let hwp = HwParams::any(&pcm).map_err(map_err("hw_params"))?;
        hwp.set_access(Access::RWInterleaved)
            .map_err(map_err("access"))?;
        hwp.set_format(Format::s32()).map_err(map_err("format"))?;
        hwp.set_channels(channels).map_err(map_err("channels"))?;
        hwp.set_rate(rate, ValueOr::Nearest).map_err(map_err("rate"))?;
        hwp.set_period_size_near(period as Frames, ValueOr::Nearest)
            .map_err(map_err("period size"))?;
        // Two periods of hardware buffer for a little xrun headroom.
        hwp.set_buffer_size_near(2 * period as Frames)
            .map_err(map_err("buffer size"))?;
        pcm.hw_params(&hwp).map_err(map_err("hw_params commit"))?;
    }

    let (actual_rate, actual_period, actual_buffer) = {
        let hwp = pcm.hw_params_current().map_err(map_err("hw_params query"))?;
        let swp = pcm.sw_params_current().map_err(map_err("sw_params"))?;
        let actual_period = hwp.get_period_size().map_err(map_err("period query"))?;
        swp.set_start_threshold(actual_period)
            .map_err(map_err("start threshold"))?;
        swp.set_avail_min(actual_period)
            .map_err(map_err("avail min"))?;
        pcm.sw_params(&swp).map_err(map_err("sw_params commit"))?;
        (
            hwp.get_rate().map_err(map_err("rate query"))?,
            actual_period,
            hwp.get_buffer_size().map_err(map_err("buffer query"))?,
        )
    };

    pcm.prepare().map_err(map_err("prepare"))?;

    let latency_ms = if actual_rate > 0 {
        actual_buffer as f32 * 1000.0 / actual_rate as f32
    } else {
        0.0
    };
    info!(
        device,
        direction = label,
        rate = actual_rate,
        channels,
        period = actual_period,
        buffer = actual_buffer,
        latency_ms = f64::from(latency_ms),
        "ALSA device configured"
    );

    Ok((pcm, latency_ms))
}

fn is_xrun(err: &alsa::Error) -> bool {
    err.errno() == libc::EPIPE || err.errno() == libc::ESTRPIPE
}

fn to_i32(sample: f32) -> i32 {
    (sample.clamp(-1.0, 1.0) * (I32_SCALE - 1.0)) as i32
}

fn audio_loop(
    playback: PCM,
    capture: PCM,
    config: AudioConfig,
    callback: SharedCallback,
    should_stop: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
) -> (PCM, PCM) {
    rt::promote_or_warn("alsa audio");
    info!("starting ALSA audio processing thread");

    run_io(&playback, &capture, &config, &callback, &should_stop, &stats);

    info!("ALSA audio processing thread stopped");
    (playback, capture)
}

fn run_io(
    playback: &PCM,
    capture: &PCM,
    config: &AudioConfig,
    callback: &SharedCallback,
    should_stop: &AtomicBool,
    stats: &SharedStats,
) {
    let frames = config.frames as usize;
    let capture_channels = config.capture_channels as usize;
    let playback_channels = config.playback_channels as usize;

    let mut capture_buf = vec![0i32; frames * capture_channels];
    let mut playback_buf = vec![0i32; frames * playback_channels];
    let mut input = vec![0.0f32; frames];
    let mut output_left = vec![0.0f32; frames];
    let mut output_right = vec![0.0f32; frames];

    let capture_io = match capture.io_i32() {
        Ok(io) => io,
        Err(e) => {
            error!("failed to acquire capture IO: {e}");
            return;
        }
    };
    let playback_io = match playback.io_i32() {
        Ok(io) => io,
        Err(e) => {
            error!("failed to acquire playback IO: {e}");
            return;
        }
    };

    let mut loop_time_min = f64::MAX;
    let mut loop_time_max = 0.0f64;
    let mut loop_time_total = 0.0f64;
    let mut clean_loops = 0u64;

    while !should_stop.load(Ordering::Relaxed) {
        let loop_start = std::time::Instant::now();
        match capture_io.readi(&mut capture_buf) {
            Ok(_) => {}
            Err(e) if is_xrun(&e) => {
                stats.capture_xruns.fetch_add(1, Ordering::Relaxed);
                let _ = capture.prepare();
                continue;
            }
            Err(e) => {
                warn!("capture error: {e}");
                let _ = capture.prepare();
                continue;
            }
        }

        // The instrument sits on the right channel of a stereo capture.
        for i in 0..frames {
            let raw = if capture_channels > 1 {
                capture_buf[i * capture_channels + 1]
            } else {
                capture_buf[i]
            };
            input[i] = raw as f32 / I32_SCALE;
        }

        (*callback.lock())(&input, &mut output_left, &mut output_right);

        for i in 0..frames {
            playback_buf[i * playback_channels] = to_i32(output_left[i]);
            if playback_channels > 1 {
                playback_buf[i * playback_channels + 1] = to_i32(output_right[i]);
            }
        }

        match playback_io.writei(&playback_buf) {
            Ok(_) => {}
            Err(e) if is_xrun(&e) => {
                stats.playback_xruns.fetch_add(1, Ordering::Relaxed);
                let _ = playback.prepare();
                continue;
            }
            Err(e) => {
                warn!("playback error: {e}");
                let _ = playback.prepare();
                continue;
            }
        }

        let loop_ms = loop_start.elapsed().as_secs_f64() * 1000.0;
        loop_time_min = loop_time_min.min(loop_ms);
        loop_time_max = loop_time_max.max(loop_ms);
        loop_time_total += loop_ms;
        clean_loops += 1;

        stats.iterations.fetch_add(1, Ordering::Relaxed);
    }

    if clean_loops > 0 {
        info!(
            iterations = clean_loops,
            min_ms = loop_time_min,
            avg_ms = loop_time_total / clean_loops as f64,
            max_ms = loop_time_max,
            "ALSA loop timing"
        );
    }
}
