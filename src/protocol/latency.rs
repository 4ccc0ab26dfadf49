//! Four-point latency accounting
//!
//! Every reply packet contributes to five rolling windows: round-trip time
//! (t4−t1), peer processing time (t3−t2), inter-arrival jitter on the peer
//! side (Δt2) and the local side (Δt4), and the ring buffer fill level.
//! Every two seconds the accumulators are logged, copied into a "current"
//! snapshot for the control API, and zeroed.

use parking_lot::Mutex;
use tracing::info;

use crate::protocol::packet::{monotonic_ns, WirePacket};

const FLUSH_INTERVAL_NS: u64 = 2_000_000_000;
const NS_PER_MS: f64 = 1_000_000.0;

/// One rolling min/avg/max window
#[derive(Debug, Clone, Copy, Default)]
struct StatWindow {
    min: u64,
    max: u64,
    total: u64,
    count: u64,
}

impl StatWindow {
    fn record(&mut self, value: u64) {
        if self.count == 0 || value < self.min {
            self.min = value;
        }
        if self.count == 0 || value > self.max {
            self.max = value;
        }
        self.total += value;
        self.count += 1;
    }

    fn avg(&self) -> u64 {
        if self.count == 0 {
            0
        } else {
            self.total / self.count
        }
    }

    fn min_ms(&self) -> f64 {
        self.min as f64 / NS_PER_MS
    }

    fn avg_ms(&self) -> f64 {
        self.avg() as f64 / NS_PER_MS
    }

    fn max_ms(&self) -> f64 {
        self.max as f64 / NS_PER_MS
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct WindowSet {
    rtt: StatWindow,
    audio_proc: StatWindow,
    peer_jitter: StatWindow,
    local_jitter: StatWindow,
    ring_fill: StatWindow,
}

struct State {
    last_peer_recv: u64,
    last_local_recv: u64,
    have_previous: bool,
    acc: WindowSet,
    current: WindowSet,
    last_flush: u64,
}

/// Metrics snapshot in milliseconds, refreshed every two seconds
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyMetrics {
    pub rtt_min_ms: f64,
    pub rtt_avg_ms: f64,
    pub rtt_max_ms: f64,

    pub audio_proc_min_ms: f64,
    pub audio_proc_avg_ms: f64,
    pub audio_proc_max_ms: f64,

    pub peer_jitter_min_ms: f64,
    pub peer_jitter_avg_ms: f64,
    pub peer_jitter_max_ms: f64,

    pub local_jitter_min_ms: f64,
    pub local_jitter_avg_ms: f64,
    pub local_jitter_max_ms: f64,

    pub ring_fill_min_ms: f64,
    pub ring_fill_avg_ms: f64,
    pub ring_fill_max_ms: f64,

    /// Hardware-level xruns reported by the audio backend
    pub xruns: u64,
}

/// Aggregates packet timings and ring fill into rolling statistics
pub struct LatencyManager {
    sample_rate: u32,
    expected_interval_ms: f32,
    backend_latency_ms: f32,
    state: Mutex<State>,
}

impl LatencyManager {
    pub fn new(sample_rate: u32, buffer_size: u32, backend_latency_ms: f32) -> Self {
        Self {
            sample_rate,
            expected_interval_ms: buffer_size as f32 / sample_rate as f32 * 1000.0,
            backend_latency_ms,
            state: Mutex::new(State {
                last_peer_recv: 0,
                last_local_recv: 0,
                have_previous: false,
                acc: WindowSet::default(),
                current: WindowSet::default(),
                last_flush: 0,
            }),
        }
    }

    /// Monotonic clock used for every timestamp on this host.
    pub fn timestamp_now() -> u64 {
        monotonic_ns()
    }

    /// Nominal interval between process callbacks, for reference.
    pub fn expected_interval_ms(&self) -> f32 {
        self.expected_interval_ms
    }

    /// One-way device latency reported by the backend at init.
    pub fn backend_latency_ms(&self) -> f32 {
        self.backend_latency_ms
    }

    /// Stamp t4 into a freshly received reply and record its timings.
    ///
    /// Clocks on the two hosts are independent, so only same-host deltas
    /// are formed; saturating subtraction keeps a reordered stamp from
    /// recording a nonsense negative value.
    pub fn process_packet(&self, packet: &mut WirePacket) {
        let t4 = monotonic_ns();
        packet.t4_local_recv = t4;

        let rtt = t4.saturating_sub(packet.t1_local_send);
        let audio_proc = packet
            .t3_remote_send
            .saturating_sub(packet.t2_remote_recv);

        let mut state = self.state.lock();
        state.acc.rtt.record(rtt);
        state.acc.audio_proc.record(audio_proc);

        if state.have_previous {
            let peer_delta = packet.t2_remote_recv.saturating_sub(state.last_peer_recv);
            let local_delta = t4.saturating_sub(state.last_local_recv);
            state.acc.peer_jitter.record(peer_delta);
            state.acc.local_jitter.record(local_delta);
        }
        state.last_peer_recv = packet.t2_remote_recv;
        state.last_local_recv = t4;
        state.have_previous = true;

        self.maybe_flush(&mut state, t4);
    }

    /// Record the ring fill level after a successful push.
    pub fn report_ring_buffer_fill(&self, frames: usize) {
        self.state.lock().acc.ring_fill.record(frames as u64);
    }

    /// The last flushed two-second snapshot, converted to milliseconds.
    ///
    /// `xruns` is left at zero here; the session folds in backend counters.
    pub fn current_metrics(&self) -> LatencyMetrics {
        let state = self.state.lock();
        let c = &state.current;
        LatencyMetrics {
            rtt_min_ms: c.rtt.min_ms(),
            rtt_avg_ms: c.rtt.avg_ms(),
            rtt_max_ms: c.rtt.max_ms(),
            audio_proc_min_ms: c.audio_proc.min_ms(),
            audio_proc_avg_ms: c.audio_proc.avg_ms(),
            audio_proc_max_ms: c.audio_proc.max_ms(),
            peer_jitter_min_ms: c.peer_jitter.min_ms(),
            peer_jitter_avg_ms: c.peer_jitter.avg_ms(),
            peer_jitter_max_ms: c.peer_jitter.max_ms(),
            local_jitter_min_ms: c.local_jitter.min_ms(),
            local_jitter_avg_ms: c.local_jitter.avg_ms(),
            local_jitter_max_ms: c.local_jitter.max_ms(),
            ring_fill_min_ms: self.frames_to_ms(c.ring_fill.min),
            ring_fill_avg_ms: self.frames_to_ms(c.ring_fill.avg()),
            ring_fill_max_ms: self.frames_to_ms(c.ring_fill.max),
            xruns: 0,
        }
    }

    fn frames_to_ms(&self, frames: u64) -> f64 {
        frames as f64 / self.sample_rate as f64 * 1000.0
    }

    fn maybe_flush(&self, state: &mut State, now: u64) {
        if state.last_flush == 0 {
            state.last_flush = now;
            return;
        }
        if now.saturating_sub(state.last_flush) < FLUSH_INTERVAL_NS {
            return;
        }
        self.flush(state, now);
    }

    fn flush(&self, state: &mut State, now: u64) {
        let a = &state.acc;
        info!(
            "BufferDelay: min={:.2}ms avg={:.2}ms max={:.2}ms | \
             RTT: min={:.2}ms avg={:.2}ms max={:.2}ms | \
             AudioProc: min={:.2}ms avg={:.2}ms max={:.2}ms | \
             PeerJitter: min={:.2}ms avg={:.2}ms max={:.2}ms | \
             LocalJitter: min={:.2}ms avg={:.2}ms max={:.2}ms",
            self.frames_to_ms(a.ring_fill.min),
            self.frames_to_ms(a.ring_fill.avg()),
            self.frames_to_ms(a.ring_fill.max),
            a.rtt.min_ms(),
            a.rtt.avg_ms(),
            a.rtt.max_ms(),
            a.audio_proc.min_ms(),
            a.audio_proc.avg_ms(),
            a.audio_proc.max_ms(),
            a.peer_jitter.min_ms(),
            a.peer_jitter.avg_ms(),
            a.peer_jitter.max_ms(),
            a.local_jitter.min_ms(),
            a.local_jitter.avg_ms(),
            a.local_jitter.max_ms(),
        );

        state.current = state.acc;
        state.acc = WindowSet::default();
        state.last_flush = now;
    }

    /// Force the two-second flush, regardless of elapsed time.
    #[cfg(test)]
    fn flush_now(&self) {
        let mut state = self.state.lock();
        let now = monotonic_ns();
        self.flush(&mut state, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_packet(t1: u64, t2: u64, t3: u64) -> WirePacket {
        let mut packet = WirePacket::from_mono(&[0.0; 64]);
        packet.t1_local_send = t1;
        packet.t2_remote_recv = t2;
        packet.t3_remote_send = t3;
        packet
    }

    #[test]
    fn window_tracks_min_avg_max() {
        let mut w = StatWindow::default();
        for v in [30, 10, 20] {
            w.record(v);
        }
        assert_eq!(w.min, 10);
        assert_eq!(w.max, 30);
        assert_eq!(w.avg(), 20);
        assert_eq!(w.count, 3);
    }

    #[test]
    fn empty_window_yields_zero_metrics() {
        let mgr = LatencyManager::new(48_000, 256, 1.0);
        assert_eq!(mgr.current_metrics(), LatencyMetrics::default());
    }

    #[test]
    fn process_packet_stamps_t4_and_never_records_negative_deltas() {
        // Anchor the monotonic clock so the stamp below is nonzero.
        let _ = monotonic_ns();
        std::thread::sleep(std::time::Duration::from_millis(1));

        let mgr = LatencyManager::new(48_000, 64, 1.0);

        // t1 in the future relative to the monotonic clock: rtt saturates
        // to zero instead of wrapping.
        let mut packet = reply_packet(u64::MAX, 500, 400);
        mgr.process_packet(&mut packet);
        assert!(packet.t4_local_recv > 0);

        mgr.flush_now();
        let metrics = mgr.current_metrics();
        assert_eq!(metrics.rtt_min_ms, 0.0);
        assert_eq!(metrics.audio_proc_min_ms, 0.0);
    }

    #[test]
    fn jitter_needs_two_arrivals() {
        let mgr = LatencyManager::new(48_000, 64, 1.0);

        let mut first = reply_packet(0, 1_000_000, 2_000_000);
        mgr.process_packet(&mut first);
        mgr.flush_now();
        let metrics = mgr.current_metrics();
        // One packet: rtt recorded, no inter-arrival deltas yet.
        assert!(metrics.rtt_avg_ms > 0.0);
        assert_eq!(metrics.peer_jitter_max_ms, 0.0);

        let mut second = reply_packet(0, 4_000_000, 5_000_000);
        mgr.process_packet(&mut second);
        mgr.flush_now();
        let metrics = mgr.current_metrics();
        // Δt2 = 3ms exactly; Δt4 is whatever the clock says, but present.
        assert_eq!(metrics.peer_jitter_avg_ms, 3.0);
        assert!(metrics.local_jitter_max_ms >= 0.0);
    }

    #[test]
    fn ring_fill_is_reported_in_milliseconds() {
        let mgr = LatencyManager::new(48_000, 256, 1.0);
        mgr.report_ring_buffer_fill(480); // 10ms at 48kHz
        mgr.report_ring_buffer_fill(960); // 20ms
        mgr.flush_now();

        let metrics = mgr.current_metrics();
        assert_eq!(metrics.ring_fill_min_ms, 10.0);
        assert_eq!(metrics.ring_fill_max_ms, 20.0);
        assert_eq!(metrics.ring_fill_avg_ms, 15.0);
    }

    #[test]
    fn flush_resets_the_accumulator() {
        let mgr = LatencyManager::new(48_000, 64, 1.0);
        let mut packet = reply_packet(0, 1, 2);
        mgr.process_packet(&mut packet);
        mgr.flush_now();
        let first = mgr.current_metrics();
        assert!(first.rtt_avg_ms > 0.0);

        // Nothing recorded since: the next flush publishes an empty window.
        mgr.flush_now();
        let second = mgr.current_metrics();
        assert_eq!(second, LatencyMetrics::default());
    }

    #[test]
    fn expected_interval_follows_buffer_and_rate() {
        let mgr = LatencyManager::new(48_000, 480, 2.5);
        assert!((mgr.expected_interval_ms() - 10.0).abs() < 1e-4);
        assert_eq!(mgr.backend_latency_ms(), 2.5);
    }
}
