//! PipeWire audio backend
//!
//! A filter node with one mono DSP input and two mono DSP outputs,
//! scheduled in the graph's real-time processing thread. The filter's main
//! loop runs on a dedicated thread that start/stop enter and exit; shutdown
//! goes through a pipewire channel that quits the loop from inside.
//!
//! The quantum is hinted via `PIPEWIRE_LATENCY` so the graph delivers the
//! configured buffer size.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use pipewire as pw;
use pw::filter::{Filter, FilterFlags, PortFlags};
use pw::properties::properties;
use tracing::info;

use crate::audio::backend::{AudioBackend, AudioConfig, BackendStats, ProcessCallback, SharedCallback};
use crate::error::AudioError;

const START_TIMEOUT: Duration = Duration::from_secs(5);

struct Terminate;

#[derive(Default)]
struct SharedStats {
    callbacks: AtomicU64,
}

/// Per-listener state owned by the PipeWire processing closure
struct ProcessData {
    callback: SharedCallback,
    stats: Arc<SharedStats>,
    /// Silence fed to the callback when the input port has no buffer yet
    silence: Vec<f32>,
}

/// Backend running a PipeWire filter in its own main-loop thread
pub struct PipewireBackend {
    config: AudioConfig,
    callback: SharedCallback,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    quit_tx: Option<pw::channel::Sender<Terminate>>,
    stats: Arc<SharedStats>,
}

impl PipewireBackend {
    pub fn new(config: &AudioConfig, callback: ProcessCallback) -> Result<Self, AudioError> {
        if config.sample_rate == 0 || config.frames == 0 {
            return Err(AudioError::InitFailed(
                "pipewire backend needs a nonzero sample rate and buffer size".into(),
            ));
        }

        // Ask the graph for our buffer size before anything connects.
        std::env::set_var(
            "PIPEWIRE_LATENCY",
            format!("{}/{}", config.frames, config.sample_rate),
        );

        Ok(Self {
            config: config.clone(),
            callback: Arc::new(Mutex::new(callback)),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
            quit_tx: None,
            stats: Arc::new(SharedStats::default()),
        })
    }
}

impl AudioBackend for PipewireBackend {
    fn start(&mut self) -> Result<(), AudioError> {
        if self.running.load(Ordering::SeqCst) {
            return Err(AudioError::AlreadyRunning);
        }

        let (quit_tx, quit_rx) = pw::channel::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let callback = self.callback.clone();
        let stats = self.stats.clone();
        let frames = self.config.frames;
        let sample_rate = self.config.sample_rate;

        let handle = thread::Builder::new()
            .name("pwar-pipewire".into())
            .spawn(move || filter_loop(frames, sample_rate, callback, stats, quit_rx, ready_tx))
            .map_err(|e| AudioError::ThreadSpawn(e.to_string()))?;

        match ready_rx.recv_timeout(START_TIMEOUT) {
            Ok(Ok(())) => {
                self.thread = Some(handle);
                self.quit_tx = Some(quit_tx);
                self.running.store(true, Ordering::SeqCst);
                info!("PipeWire backend started");
                Ok(())
            }
            Ok(Err(message)) => {
                let _ = handle.join();
                Err(AudioError::Pipewire(message))
            }
            Err(_) => {
                let _ = quit_tx.send(Terminate);
                let _ = handle.join();
                Err(AudioError::Pipewire(
                    "timed out waiting for the filter to connect".into(),
                ))
            }
        }
    }

    fn stop(&mut self) -> Result<(), AudioError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(AudioError::NotRunning);
        }
        if let Some(quit_tx) = self.quit_tx.take() {
            let _ = quit_tx.send(Terminate);
        }
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        self.running.store(false, Ordering::SeqCst);
        info!("PipeWire backend stopped");
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
            discontinuities: 0,
        }
    }

    /// One quantum of graph latency.
    fn latency_ms(&self) -> f32 {
        self.config.frames as f32 / self.config.sample_rate as f32 * 1000.0
    }
}

impl Drop for PipewireBackend {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop();
        }
    }
}

/// Serialize a ProcessLatency param declaring one buffer of latency, the
/// counterpart of `spa_process_latency_build` in the C API.
fn build_process_latency_pod(latency_ns: i64) -> Result<Vec<u8>, String> {
    use pw::spa::pod::serialize::PodSerializer;
    use pw::spa::pod::{Object, Property, PropertyFlags, Value};

    let object = Object {
        type_: pw::spa::sys::SPA_TYPE_OBJECT_ParamProcessLatency,
        id: pw::spa::sys::SPA_PARAM_ProcessLatency,
        properties: vec![Property {
            key: pw::spa::sys::SPA_PARAM_PROCESS_LATENCY_ns,
            flags: PropertyFlags::empty(),
            value: Value::Long(latency_ns),
        }],
    };

    PodSerializer::serialize(std::io::Cursor::new(Vec::new()), &Value::Object(object))
        .map(|(cursor, _)| cursor.into_inner())
        .map_err(|e| format!("process latency pod: {e:?}"))
}

fn filter_loop(
    frames: u32,
    sample_rate: u32,
    callback: SharedCallback,
    stats: Arc<SharedStats>,
    quit_rx: pw::channel::Receiver<Terminate>,
    ready_tx: mpsc::Sender<Result<(), String>>,
) {
    pw::init();

    let mainloop = match pw::main_loop::MainLoop::new(None) {
        Ok(l) => l,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("main loop: {e}")));
            return;
        }
    };
    let context = match pw::context::Context::new(&mainloop) {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("context: {e}")));
            return;
        }
    };
    let core = match context.connect(None) {
        Ok(c) => c,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("core connect: {e}")));
            return;
        }
    };

    let filter = match Filter::new(
        &core,
        "pwar",
        properties! {
            *pw::keys::MEDIA_TYPE => "Audio",
            *pw::keys::MEDIA_CATEGORY => "Filter",
            *pw::keys::MEDIA_ROLE => "DSP",
        },
    ) {
        Ok(f) => f,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("filter: {e}")));
            return;
        }
    };

    let mut make_port = |direction, name: &str| {
        filter
            .add_port(
                direction,
                PortFlags::MAP_BUFFERS,
                properties! {
                    *pw::keys::FORMAT_DSP => "32 bit float mono audio",
                    *pw::keys::PORT_NAME => name,
                },
                None,
            )
            .map_err(|e| format!("port {name}: {e}"))
    };

    use pw::spa::utils::Direction;
    let in_port = match make_port(Direction::Input, "input") {
        Ok(p) => p,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let out_left_port = match make_port(Direction::Output, "output-left") {
        Ok(p) => p,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let out_right_port = match make_port(Direction::Output, "output-right") {
        Ok(p) => p,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let data = ProcessData {
        callback,
        stats,
        silence: vec![0.0; frames as usize],
    };

    let _listener = match filter
        .add_local_listener_with_user_data(data)
        .process(move |filter, data, position| {
            let n_samples = position.clock.duration as u32;
            let n = n_samples as usize;

            let input = filter.get_dsp_buffer::<f32>(&in_port, n_samples);
            let out_left = filter.get_dsp_buffer::<f32>(&out_left_port, n_samples);
            let out_right = filter.get_dsp_buffer::<f32>(&out_right_port, n_samples);

            if let (Some(out_left), Some(out_right)) = (out_left, out_right) {
                if data.silence.len() < n {
                    data.silence.resize(n, 0.0);
                }
                let input: &[f32] = match input {
                    Some(buffer) => buffer,
                    None => &data.silence[..n],
                };
                (*data.callback.lock())(input, out_left, out_right);
                data.stats.callbacks.fetch_add(1, Ordering::Relaxed);
            }
        })
        .register()
    {
        Ok(l) => l,
        Err(e) => {
            let _ = ready_tx.send(Err(format!("listener: {e}")));
            return;
        }
    };

    let latency_ns = i64::from(frames) * 1_000_000_000 / i64::from(sample_rate);
    let latency_bytes = match build_process_latency_pod(latency_ns) {
        Ok(bytes) => bytes,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let latency_pod = match pw::spa::pod::Pod::from_bytes(&latency_bytes) {
        Some(pod) => pod,
        None => {
            let _ = ready_tx.send(Err("process latency pod: invalid bytes".into()));
            return;
        }
    };

    let mut params = [latency_pod];
    if let Err(e) = filter.connect(FilterFlags::RT_PROCESS, &mut params) {
        let _ = ready_tx.send(Err(format!("filter connect: {e}")));
        return;
    }

    let loop_quit = mainloop.clone();
    let _quit_guard = quit_rx.attach(mainloop.loop_(), move |_| loop_quit.quit());

    let _ = ready_tx.send(Ok(()));
    info!("starting PipeWire filter loop");
    mainloop.run();
    info!("PipeWire filter loop stopped");
}
