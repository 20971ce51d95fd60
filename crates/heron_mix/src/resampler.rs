//! Linear-Interpolation Resampler
//!
//! Converts an arbitrary input rate to the device rate with a Q32
//! fixed-point phase accumulator and two-point interpolation. Quality is
//! deliberately modest; the contract that matters here is that it pulls
//! its input through a `BufferProvider`, produces exactly the frames it
//! is asked for (or fewer when the provider runs dry), adds no group
//! delay, and carries its phase and edge samples across calls so chunk
//! boundaries are seamless.
//!
//! # Real-time Safety
//! No allocations, no syscalls; O(in + out) per call.

use crate::buffer::BufferProvider;

/// One full input frame of phase, in Q32.
const PHASE_ONE: u64 = 1 << 32;

pub struct LinearResampler {
    in_rate: u32,
    out_rate: u32,
    channels: u16,
    /// Offset of the next output relative to `prev`, in Q32. Held at or
    /// below `PHASE_ONE` between outputs; exactly `PHASE_ONE` means the
    /// output lands on `cur`, so identity rates never need a lookahead
    /// frame.
    phase: u64,
    /// Input frames per output frame, Q32.
    increment: u64,
    prev: [i16; 2],
    cur: [i16; 2],
    /// `prev` holds a real input frame.
    have_prev: bool,
    /// Both edge samples are established; interpolation may run.
    primed: bool,
}

impl LinearResampler {
    pub fn new(in_rate: u32, out_rate: u32, channels: u16) -> Self {
        let mut r = Self {
            in_rate,
            out_rate,
            channels,
            phase: 0,
            increment: 0,
            prev: [0; 2],
            cur: [0; 2],
            have_prev: false,
            primed: false,
        };
        r.update_increment();
        r
    }

    pub fn set_rates(&mut self, in_rate: u32, out_rate: u32) {
        if in_rate != self.in_rate || out_rate != self.out_rate {
            self.in_rate = in_rate;
            self.out_rate = out_rate;
            self.update_increment();
            self.reset();
        }
    }

    pub fn set_channels(&mut self, channels: u16) {
        if channels != self.channels {
            self.channels = channels;
            self.reset();
        }
    }

    /// Forget phase and edge samples (track flushed or re-routed).
    pub fn reset(&mut self) {
        self.phase = 0;
        self.prev = [0; 2];
        self.cur = [0; 2];
        self.have_prev = false;
        self.primed = false;
    }

    fn update_increment(&mut self) {
        self.increment = (self.in_rate as u64) * PHASE_ONE / (self.out_rate as u64).max(1);
    }

    /// Produce up to `out_frames` interleaved stereo frames into `dst`,
    /// pulling input through `provider`. Returns the frames produced;
    /// a short count means the provider ran dry and the caller treats
    /// the remainder as silence.
    pub fn resample(
        &mut self,
        dst: &mut [i16],
        out_frames: usize,
        provider: &dyn BufferProvider,
    ) -> usize {
        debug_assert!(dst.len() >= out_frames * 2);
        let ch = self.channels as usize;
        let mut produced = 0;

        'produce: while produced < out_frames {
            // Establish both edge samples, then advance input until the
            // phase falls inside [prev, cur].
            while !self.primed || self.phase > PHASE_ONE {
                let want = (((out_frames - produced) as u64 * self.increment) >> 32) as usize + 2;
                let chunk = match provider.get_next_buffer(want) {
                    Ok(c) => c,
                    Err(_) => break 'produce,
                };
                let mut used = 0;
                while used < chunk.frames && (!self.primed || self.phase > PHASE_ONE) {
                    let base = used * ch;
                    let left = chunk.data[base];
                    let right = if ch >= 2 { chunk.data[base + 1] } else { left };
                    used += 1;
                    if !self.have_prev {
                        self.prev = [left, right];
                        self.have_prev = true;
                    } else if !self.primed {
                        self.cur = [left, right];
                        self.primed = true;
                    } else {
                        self.prev = self.cur;
                        self.cur = [left, right];
                        self.phase -= PHASE_ONE;
                    }
                }
                provider.release_buffer(used);
            }

            // frac is in [0, PHASE_ONE]; the upper bound maps exactly
            // onto `cur`.
            let frac = self.phase;
            for c in 0..2 {
                let a = self.prev[c] as i64;
                let b = self.cur[c] as i64;
                let v = a + (((b - a) * frac as i64) >> 32);
                dst[produced * 2 + c] = v as i16;
            }
            produced += 1;
            self.phase += self.increment;
        }

        produced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SliceProvider;

    fn run(in_rate: u32, out_rate: u32, channels: u16, input: &[i16], out_frames: usize) -> Vec<i16> {
        let mut resampler = LinearResampler::new(in_rate, out_rate, channels);
        let provider = SliceProvider::new(input, channels as usize);
        let mut dst = vec![0i16; out_frames * 2];
        let produced = resampler.resample(&mut dst, out_frames, &provider);
        dst.truncate(produced * 2);
        dst
    }

    #[test]
    fn test_identity_rate_passthrough() {
        let input: Vec<i16> = (0..32).collect();
        let out = run(48000, 48000, 2, &input, 16);
        assert_eq!(out, input);
    }

    #[test]
    fn test_identity_preserves_impulse_position() {
        // An impulse must come out at the same index: any group delay or
        // duplicated leading frame shifts it.
        let input: Vec<i16> = vec![0, 0, 0, 1000, 0, 0, 0, 0];
        let out = run(48000, 48000, 1, &input, 8);
        let left: Vec<i16> = out.chunks_exact(2).map(|p| p[0]).collect();
        assert_eq!(left, input);
    }

    #[test]
    fn test_mono_input_duplicated() {
        let input: Vec<i16> = vec![100, 200, 300, 400];
        let out = run(48000, 48000, 1, &input, 4);
        assert_eq!(out, vec![100, 100, 200, 200, 300, 300, 400, 400]);
    }

    #[test]
    fn test_upsampling_produces_requested_frames() {
        let input = vec![0i16; 2 * 441];
        let out = run(44100, 48000, 2, &input, 400);
        assert_eq!(out.len(), 400 * 2);
    }

    #[test]
    fn test_double_rate_ramp_is_exact() {
        // 2x upsampling a linear ramp lands every output exactly on the
        // line: out[k] = 50 * k, with no phase offset at the start.
        let input: Vec<i16> = (0..100).map(|i| i * 100).collect();
        let out = run(22050, 44100, 1, &input, 120);
        let left: Vec<i16> = out.chunks_exact(2).map(|p| p[0]).collect();
        assert!(left.len() >= 100);
        for (k, &s) in left.iter().enumerate() {
            assert_eq!(s, (k as i16) * 50, "sample {k}");
        }
    }

    #[test]
    fn test_upsampling_interpolates_ramp() {
        // A linear ramp resampled linearly stays a ramp: every output
        // sample must lie between its neighbors.
        let input: Vec<i16> = (0..200).map(|i| i * 100).collect();
        let out = run(22050, 44100, 1, &input, 300);
        for pair in out.chunks_exact(2) {
            assert_eq!(pair[0], pair[1]);
        }
        let left: Vec<i16> = out.chunks_exact(2).map(|p| p[0]).collect();
        for w in left.windows(2) {
            assert!(w[1] >= w[0], "ramp must stay monotone: {:?}", w);
        }
    }

    #[test]
    fn test_short_provider_consumes_everything() {
        // At identity rate every input frame becomes exactly one output
        // frame, including the last one.
        let input: Vec<i16> = (0..20).collect();
        let out = run(48000, 48000, 2, &input, 100);
        assert_eq!(out, input);
    }

    #[test]
    fn test_phase_carries_across_calls() {
        let input: Vec<i16> = (0..100).map(|i| i * 50).collect();
        let mut resampler = LinearResampler::new(32000, 48000, 1);
        let provider = SliceProvider::new(&input, 1);

        let mut a = vec![0i16; 20 * 2];
        let mut b = vec![0i16; 20 * 2];
        resampler.resample(&mut a, 20, &provider);
        resampler.resample(&mut b, 20, &provider);

        // The seam between the two calls must stay monotone too.
        let last_a = a[a.len() - 2];
        let first_b = b[0];
        assert!(first_b >= last_a, "{last_a} then {first_b}");
    }

    #[test]
    fn test_reset_clears_state() {
        let input: Vec<i16> = vec![1000; 8];
        let mut resampler = LinearResampler::new(44100, 48000, 1);
        let provider = SliceProvider::new(&input, 1);
        let mut dst = vec![0i16; 8];
        resampler.resample(&mut dst, 4, &provider);

        resampler.reset();
        assert!(!resampler.primed);
        assert!(!resampler.have_prev);
        assert_eq!(resampler.phase, 0);
    }
}
