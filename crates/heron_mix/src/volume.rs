//! Fixed-Point Gain Arithmetic
//!
//! The mix bus works in Q4.12: `0x1000` is unity, clamped at `0x2000`
//! (+6 dB). Ramps run in Q4.28 so a one-block ramp has sub-LSB
//! resolution even at large block sizes.

/// Unity gain in Q4.12.
pub const UNITY_GAIN: i32 = 0x1000;

/// Maximum accepted gain in Q4.12 (two times unity).
pub const MAX_GAIN: i32 = 0x2000;

/// Convert a linear float gain to clamped Q4.12.
#[inline]
pub fn gain_from_float(gain: f32) -> i32 {
    if gain <= 0.0 {
        return 0;
    }
    ((gain * UNITY_GAIN as f32) as i32).min(MAX_GAIN)
}

/// Convert Q4.12 back to linear float.
#[inline]
pub fn float_from_gain(gain: i32) -> f32 {
    gain as f32 / UNITY_GAIN as f32
}

/// One channel's gain with an optional per-block linear ramp.
///
/// While ramping, the live value advances in Q4.28 steps each frame and
/// lands exactly on the target at the end of the block.
#[derive(Debug, Clone, Copy)]
pub struct RampedGain {
    /// Live value in Q4.28.
    current: i64,
    /// Per-frame increment in Q4.28; zero when settled.
    step: i64,
    /// Target in Q4.12.
    target: i32,
}

impl RampedGain {
    pub fn new(gain: i32) -> Self {
        let gain = gain.clamp(0, MAX_GAIN);
        Self {
            current: (gain as i64) << 16,
            step: 0,
            target: gain,
        }
    }

    /// Jump straight to `gain` with no ramp.
    pub fn set(&mut self, gain: i32) {
        let gain = gain.clamp(0, MAX_GAIN);
        self.current = (gain as i64) << 16;
        self.step = 0;
        self.target = gain;
    }

    /// Ramp linearly from the live value to `gain` over `frames` frames.
    pub fn ramp_to(&mut self, gain: i32, frames: usize) {
        let gain = gain.clamp(0, MAX_GAIN);
        self.target = gain;
        if frames == 0 {
            self.set(gain);
            return;
        }
        let end = (gain as i64) << 16;
        self.step = (end - self.current) / frames as i64;
    }

    /// Q4.12 gain for the current frame, then advance the ramp.
    #[inline]
    pub fn next(&mut self) -> i32 {
        let gain = (self.current >> 16) as i32;
        if self.step != 0 {
            self.current += self.step;
            let end = (self.target as i64) << 16;
            let overshot = (self.step > 0 && self.current >= end)
                || (self.step < 0 && self.current <= end);
            if overshot {
                self.current = end;
                self.step = 0;
            }
        }
        gain
    }

    pub fn target(&self) -> i32 {
        self.target
    }

    pub fn is_ramping(&self) -> bool {
        self.step != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_conversions() {
        assert_eq!(gain_from_float(1.0), UNITY_GAIN);
        assert_eq!(gain_from_float(0.0), 0);
        assert_eq!(gain_from_float(-1.0), 0);
        assert_eq!(gain_from_float(10.0), MAX_GAIN);
        assert!((float_from_gain(UNITY_GAIN) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_instant_set() {
        let mut gain = RampedGain::new(0);
        gain.set(UNITY_GAIN);
        assert_eq!(gain.next(), UNITY_GAIN);
        assert!(!gain.is_ramping());
    }

    #[test]
    fn test_ramp_reaches_target() {
        let mut gain = RampedGain::new(0);
        gain.ramp_to(UNITY_GAIN, 256);
        assert!(gain.is_ramping());

        let mut last = -1;
        for _ in 0..256 {
            let g = gain.next();
            assert!(g >= last, "ramp must be monotone");
            last = g;
        }
        assert_eq!(gain.next(), UNITY_GAIN);
        assert!(!gain.is_ramping());
    }

    #[test]
    fn test_ramp_down() {
        let mut gain = RampedGain::new(UNITY_GAIN);
        gain.ramp_to(0, 100);
        for _ in 0..100 {
            gain.next();
        }
        assert_eq!(gain.next(), 0);
    }

    #[test]
    fn test_zero_length_ramp_is_a_jump() {
        let mut gain = RampedGain::new(0);
        gain.ramp_to(UNITY_GAIN, 0);
        assert_eq!(gain.next(), UNITY_GAIN);
    }
}
