//! Master and Per-Stream Volume State
//!
//! Shared between the server API and every playback thread. Values live
//! in bit-cast atomics so the real-time loops read them lock-free; the
//! effective gain of a track is `master × stream × track`, computed each
//! cycle in the thread's prepare step.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::types::StreamType;

pub struct StreamVolumes {
    master_bits: AtomicU32,
    master_muted: AtomicBool,
    stream_bits: [AtomicU32; StreamType::COUNT],
    stream_muted: [AtomicBool; StreamType::COUNT],
}

impl StreamVolumes {
    pub fn new() -> Self {
        Self {
            master_bits: AtomicU32::new(1.0_f32.to_bits()),
            master_muted: AtomicBool::new(false),
            stream_bits: std::array::from_fn(|_| AtomicU32::new(1.0_f32.to_bits())),
            stream_muted: std::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    pub fn set_master_volume(&self, volume: f32) {
        self.master_bits
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn master_volume(&self) -> f32 {
        f32::from_bits(self.master_bits.load(Ordering::Relaxed))
    }

    pub fn set_master_mute(&self, muted: bool) {
        self.master_muted.store(muted, Ordering::Relaxed);
    }

    pub fn master_muted(&self) -> bool {
        self.master_muted.load(Ordering::Relaxed)
    }

    pub fn set_stream_volume(&self, stream: StreamType, volume: f32) {
        self.stream_bits[stream.index()]
            .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn stream_volume(&self, stream: StreamType) -> f32 {
        f32::from_bits(self.stream_bits[stream.index()].load(Ordering::Relaxed))
    }

    pub fn set_stream_mute(&self, stream: StreamType, muted: bool) {
        self.stream_muted[stream.index()].store(muted, Ordering::Relaxed);
    }

    pub fn stream_muted(&self, stream: StreamType) -> bool {
        self.stream_muted[stream.index()].load(Ordering::Relaxed)
    }

    /// Combined master × stream factor, zero when either side is muted.
    pub fn factor(&self, stream: StreamType) -> f32 {
        if self.master_muted() || self.stream_muted(stream) {
            return 0.0;
        }
        self.master_volume() * self.stream_volume(stream)
    }
}

impl Default for StreamVolumes {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_unity() {
        let v = StreamVolumes::new();
        assert_eq!(v.factor(StreamType::Music), 1.0);
    }

    #[test]
    fn test_factor_combines() {
        let v = StreamVolumes::new();
        v.set_master_volume(0.5);
        v.set_stream_volume(StreamType::Ring, 0.5);
        assert!((v.factor(StreamType::Ring) - 0.25).abs() < 1e-6);
        assert!((v.factor(StreamType::Music) - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_mutes_zero_the_factor() {
        let v = StreamVolumes::new();
        v.set_stream_mute(StreamType::Alarm, true);
        assert_eq!(v.factor(StreamType::Alarm), 0.0);
        assert_eq!(v.factor(StreamType::Music), 1.0);

        v.set_master_mute(true);
        assert_eq!(v.factor(StreamType::Music), 0.0);
    }

    #[test]
    fn test_clamping() {
        let v = StreamVolumes::new();
        v.set_master_volume(7.0);
        assert_eq!(v.master_volume(), 1.0);
        v.set_master_volume(-2.0);
        assert_eq!(v.master_volume(), 0.0);
    }
}
