//! Shared PCM ring buffer between the UDP receiver and the audio callback
//!
//! The receiver is the sole producer, the audio callback the sole consumer;
//! a single mutex protects every state-mutating operation. The buffer is
//! created fully prefilled with silence so the consumer has a full depth of
//! safety margin before the network delivers anything.
//!
//! Recovery policies are deliberately blunt:
//! - overrun: drop the oldest frames so the freshest audio survives, one
//!   counter tick per offending push
//! - underrun: emit one buffer of silence and re-prefill the whole ring,
//!   trading a single predictable dropout for restored margin

use parking_lot::Mutex;
use tracing::warn;

use crate::error::RingBufferError;

/// Bounded queue of interleaved f32 PCM frames
#[derive(Debug)]
pub struct RingBuffer {
    inner: Mutex<Inner>,
    depth: usize,
    channels: usize,
    expected_buffer_size: usize,
}

#[derive(Debug)]
struct Inner {
    buf: Vec<f32>,
    write_index: usize,
    read_index: usize,
    available: usize,
    overruns: u32,
    underruns: u32,
}

impl Inner {
    /// Zero the audio content and restore the full silence margin.
    fn prefill(&mut self, depth: usize) {
        self.buf.fill(0.0);
        self.write_index = 0;
        self.read_index = 0;
        self.available = depth;
    }
}

impl RingBuffer {
    /// Allocate a ring of `depth` frames, prefilled with silence.
    ///
    /// `expected_buffer_size` is the nominal per-callback drain, kept for
    /// latency accounting.
    pub fn new(
        depth: usize,
        channels: usize,
        expected_buffer_size: usize,
    ) -> Result<Self, RingBufferError> {
        if depth == 0 {
            return Err(RingBufferError::ZeroDepth);
        }
        if channels == 0 {
            return Err(RingBufferError::ZeroChannels);
        }

        Ok(Self {
            inner: Mutex::new(Inner {
                buf: vec![0.0; depth * channels],
                write_index: 0,
                read_index: 0,
                available: depth,
                overruns: 0,
                underruns: 0,
            }),
            depth,
            channels,
            expected_buffer_size,
        })
    }

    /// Capacity in frames.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Configured channel count.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Nominal frames drained per audio callback.
    pub fn expected_buffer_size(&self) -> usize {
        self.expected_buffer_size
    }

    /// Append `n_samples` interleaved frames from `src`.
    ///
    /// When the frames do not fit, the oldest content is dropped to make
    /// room and `overruns` is incremented once.
    pub fn push(
        &self,
        src: &[f32],
        n_samples: usize,
        channels: usize,
    ) -> Result<(), RingBufferError> {
        if channels != self.channels {
            return Err(RingBufferError::ChannelMismatch {
                got: channels,
                expected: self.channels,
            });
        }
        let need = n_samples * channels;
        if src.len() < need {
            return Err(RingBufferError::ShortSlice {
                got: src.len(),
                need,
            });
        }
        if n_samples == 0 {
            return Ok(());
        }

        let mut inner = self.inner.lock();

        let free = self.depth - inner.available;
        if n_samples >= self.depth && n_samples > free {
            // The push alone refills the entire ring: everything previously
            // held is lost and only the tail of the new frames survives.
            inner.overruns += 1;
            let skip = (n_samples - self.depth) * channels;
            inner.buf.copy_from_slice(&src[skip..skip + self.depth * channels]);
            inner.write_index = 0;
            inner.read_index = 0;
            inner.available = self.depth;
            warn!(
                dropped = n_samples - free,
                total = inner.overruns,
                "ring buffer overrun, push larger than remaining space"
            );
            return Ok(());
        }

        if n_samples > free {
            let skip = n_samples - free;
            inner.read_index = (inner.read_index + skip) % self.depth;
            inner.available -= skip;
            warn!(
                skipped = skip,
                total = inner.overruns + 1,
                "ring buffer overrun, dropping oldest frames"
            );
            inner.overruns += 1;
        }

        // At most two contiguous segments: up to the end of the ring, then
        // the wrapped remainder from the start.
        let first = n_samples.min(self.depth - inner.write_index);
        let w = inner.write_index * channels;
        inner.buf[w..w + first * channels].copy_from_slice(&src[..first * channels]);
        let second = n_samples - first;
        if second > 0 {
            inner.buf[..second * channels]
                .copy_from_slice(&src[first * channels..n_samples * channels]);
        }
        inner.write_index = (inner.write_index + n_samples) % self.depth;
        inner.available += n_samples;

        Ok(())
    }

    /// Remove `n_samples` interleaved frames into `dst`, returning how many
    /// frames were written (always the full request).
    ///
    /// On underrun the full request is answered with silence, `underruns`
    /// is incremented once and the ring is re-prefilled.
    pub fn pop(
        &self,
        dst: &mut [f32],
        n_samples: usize,
        channels: usize,
    ) -> Result<usize, RingBufferError> {
        if channels != self.channels {
            return Err(RingBufferError::ChannelMismatch {
                got: channels,
                expected: self.channels,
            });
        }
        let need = n_samples * channels;
        if dst.len() < need {
            return Err(RingBufferError::ShortSlice {
                got: dst.len(),
                need,
            });
        }
        if n_samples == 0 {
            return Ok(0);
        }

        let mut inner = self.inner.lock();

        if n_samples > inner.available {
            inner.underruns += 1;
            warn!(
                requested = n_samples,
                available = inner.available,
                total = inner.underruns,
                "ring buffer underrun, emitting silence and re-prefilling"
            );
            dst[..need].fill(0.0);
            inner.prefill(self.depth);
            return Ok(n_samples);
        }

        let first = n_samples.min(self.depth - inner.read_index);
        let r = inner.read_index * channels;
        dst[..first * channels].copy_from_slice(&inner.buf[r..r + first * channels]);
        let second = n_samples - first;
        if second > 0 {
            dst[first * channels..n_samples * channels]
                .copy_from_slice(&inner.buf[..second * channels]);
        }
        inner.read_index = (inner.read_index + n_samples) % self.depth;
        inner.available -= n_samples;

        Ok(n_samples)
    }

    /// Frames currently readable.
    pub fn available(&self) -> usize {
        self.inner.lock().available
    }

    /// Overrun events since creation or the last stats reset.
    pub fn overruns(&self) -> u32 {
        self.inner.lock().overruns
    }

    /// Underrun events since creation or the last stats reset.
    pub fn underruns(&self) -> u32 {
        self.inner.lock().underruns
    }

    /// Zero both event counters without touching audio content.
    pub fn reset_stats(&self) {
        let mut inner = self.inner.lock();
        inner.overruns = 0;
        inner.underruns = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CH: usize = 2;

    fn ring() -> RingBuffer {
        RingBuffer::new(1024, CH, 256).unwrap()
    }

    fn frames(n: usize, value: f32) -> Vec<f32> {
        vec![value; n * CH]
    }

    fn pop_frames(rb: &RingBuffer, n: usize) -> Vec<f32> {
        let mut out = vec![-2.0; n * CH];
        let got = rb.pop(&mut out, n, CH).unwrap();
        assert_eq!(got, n);
        out
    }

    #[test]
    fn fresh_ring_is_fully_prefilled() {
        let rb = ring();
        assert_eq!(rb.available(), 1024);
        assert_eq!(rb.overruns(), 0);
        assert_eq!(rb.underruns(), 0);
    }

    #[test]
    fn rejects_degenerate_geometry() {
        assert_eq!(RingBuffer::new(0, 2, 64).unwrap_err(), RingBufferError::ZeroDepth);
        assert_eq!(
            RingBuffer::new(64, 0, 64).unwrap_err(),
            RingBufferError::ZeroChannels
        );
    }

    #[test]
    fn prefill_silence_is_served_before_pushed_audio() {
        let rb = ring();
        // Pushing into the full prefill drops the 100 oldest silence frames.
        rb.push(&frames(100, 0.7), 100, CH).unwrap();
        assert_eq!(rb.available(), 1024);
        assert_eq!(rb.overruns(), 1);

        // 924 frames of prefill silence remain ahead of the audio.
        assert!(pop_frames(&rb, 768).iter().all(|&s| s == 0.0));
        assert!(pop_frames(&rb, 156).iter().all(|&s| s == 0.0));
        assert!(pop_frames(&rb, 100).iter().all(|&s| s == 0.7));
        assert_eq!(rb.available(), 0);
    }

    #[test]
    fn underrun_answers_with_silence_and_reprefills() {
        let rb = ring();
        let out = pop_frames(&rb, 1024);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(rb.available(), 0);

        // More than available: silence, one underrun, full margin restored.
        let mut out = vec![1.0; 1200 * CH];
        assert_eq!(rb.pop(&mut out, 1200, CH).unwrap(), 1200);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(rb.underruns(), 1);
        assert_eq!(rb.available(), 1024);
    }

    #[test]
    fn values_pushed_after_an_underrun_come_back_intact() {
        let rb = ring();
        let mut out = vec![0.0; 1200 * CH];
        rb.pop(&mut out, 1200, CH).unwrap();

        // The reset dropped everything; drain the fresh prefill, then the
        // new audio must come back exactly.
        rb.push(&frames(64, 0.25), 64, CH).unwrap();
        assert!(pop_frames(&rb, 960).iter().all(|&s| s == 0.0));
        assert!(pop_frames(&rb, 64).iter().all(|&s| s == 0.25));
    }

    #[test]
    fn oversized_push_keeps_the_tail() {
        let rb = ring();
        let mut src = Vec::with_capacity(1200 * CH);
        for i in 0..1200 {
            src.push(i as f32);
            src.push(i as f32);
        }
        rb.push(&src, 1200, CH).unwrap();
        assert_eq!(rb.overruns(), 1);
        assert_eq!(rb.available(), 1024);

        let out = pop_frames(&rb, 1024);
        for i in 0..1024 {
            assert_eq!(out[i * CH], (176 + i) as f32);
            assert_eq!(out[i * CH + 1], (176 + i) as f32);
        }
    }

    #[test]
    fn channel_mismatch_is_rejected_without_mutation() {
        let rb = ring();
        let src = frames(32, 1.0);
        assert_eq!(
            rb.push(&src, 32, 4),
            Err(RingBufferError::ChannelMismatch { got: 4, expected: CH })
        );
        let mut dst = frames(32, 0.0);
        assert!(rb.pop(&mut dst, 32, 1).is_err());

        assert_eq!(rb.available(), 1024);
        assert_eq!(rb.overruns(), 0);
        assert_eq!(rb.underruns(), 0);
    }

    #[test]
    fn short_slices_are_rejected() {
        let rb = ring();
        let src = frames(10, 1.0);
        assert!(matches!(
            rb.push(&src, 32, CH),
            Err(RingBufferError::ShortSlice { .. })
        ));
        let mut dst = frames(10, 0.0);
        assert!(rb.pop(&mut dst, 32, CH).is_err());
    }

    #[test]
    fn zero_sample_operations_are_noops() {
        let rb = ring();
        rb.push(&[], 0, CH).unwrap();
        let mut dst: [f32; 0] = [];
        assert_eq!(rb.pop(&mut dst, 0, CH).unwrap(), 0);
        assert_eq!(rb.available(), 1024);
        assert_eq!(rb.overruns(), 0);
        assert_eq!(rb.underruns(), 0);
    }

    #[test]
    fn conservation_holds_without_xruns() {
        let rb = RingBuffer::new(256, CH, 64).unwrap();
        // Drain the prefill so pushes have room.
        pop_frames(&rb, 256);

        let mut pushed = 0usize;
        let mut popped = 0usize;
        for round in 0..10 {
            let n = 16 + (round % 5) * 8;
            rb.push(&frames(n, 0.5), n, CH).unwrap();
            pushed += n;
            let m = n / 2;
            pop_frames(&rb, m);
            popped += m;
            assert_eq!(rb.available(), pushed - popped);
            assert!(rb.available() <= rb.depth());
        }
        assert_eq!(rb.overruns(), 0);
        assert_eq!(rb.underruns(), 0);
    }

    #[test]
    fn wrapping_round_trip_preserves_order() {
        let rb = RingBuffer::new(64, CH, 16).unwrap();
        pop_frames(&rb, 64);

        // Push/pop staggered so indices wrap several times.
        let mut next = 0.0f32;
        let mut expect = 0.0f32;
        for _ in 0..10 {
            let mut src = Vec::new();
            for _ in 0..48 {
                src.push(next);
                src.push(-next);
                next += 1.0;
            }
            rb.push(&src, 48, CH).unwrap();

            let out = pop_frames(&rb, 48);
            for f in 0..48 {
                assert_eq!(out[f * CH], expect);
                assert_eq!(out[f * CH + 1], -expect);
                expect += 1.0;
            }
        }
    }

    #[test]
    fn push_exactly_filling_and_pop_exactly_draining() {
        let rb = RingBuffer::new(128, CH, 32).unwrap();
        pop_frames(&rb, 128);

        rb.push(&frames(128, 0.1), 128, CH).unwrap();
        assert_eq!(rb.available(), 128);
        assert_eq!(rb.overruns(), 0);

        let out = pop_frames(&rb, 128);
        assert!(out.iter().all(|&s| s == 0.1));
        assert_eq!(rb.available(), 0);
        assert_eq!(rb.underruns(), 0);
    }

    #[test]
    fn reset_stats_keeps_audio_content() {
        let rb = ring();
        rb.push(&frames(100, 0.9), 100, CH).unwrap(); // overrun against prefill
        let mut out = vec![0.0; 1200 * CH];
        rb.pop(&mut out, 1200, CH).unwrap(); // underrun

        rb.push(&frames(32, 0.4), 32, CH).unwrap();
        rb.reset_stats();
        assert_eq!(rb.overruns(), 0);
        assert_eq!(rb.underruns(), 0);

        // Content written before the reset is still there, behind prefill.
        assert_eq!(rb.available(), 1024);
        pop_frames(&rb, 992);
        assert!(pop_frames(&rb, 32).iter().all(|&s| s == 0.4));
    }
}
