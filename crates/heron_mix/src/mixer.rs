//! Output Mix Pipeline
//!
//! A fixed pool of named track slots feeding one interleaved stereo
//! 16-bit output block. Each `process()` pulls from every enabled slot's
//! provider, resamples where the track rate differs from the device
//! rate, applies Q4.12 per-channel gains (optionally ramped across the
//! block), accumulates, dithers, and clamps. `process()` always
//! terminates and never blocks on I/O: a provider that comes up short
//! contributes silence for the rest of the cycle.
//!
//! Mono tracks are duplicated to both output channels; the device side
//! of this pipeline is always stereo.

use std::sync::Arc;

use tracing::trace;

use crate::buffer::BufferProvider;
use crate::error::{MixError, MixResult};
use crate::resampler::LinearResampler;
use crate::volume::{RampedGain, MAX_GAIN};

/// Number of track slots per mixer.
pub const MAX_TRACKS: usize = 32;

struct TrackSlot {
    in_use: bool,
    enabled: bool,
    channels: u16,
    sample_rate: u32,
    provider: Option<Arc<dyn BufferProvider>>,
    resampler: Option<LinearResampler>,
    gain: [RampedGain; 2],
}

impl TrackSlot {
    fn vacant() -> Self {
        Self {
            in_use: false,
            enabled: false,
            channels: 2,
            sample_rate: 0,
            provider: None,
            resampler: None,
            gain: [RampedGain::new(0), RampedGain::new(0)],
        }
    }
}

pub struct AudioMixer {
    frame_count: usize,
    device_rate: u32,
    slots: Vec<TrackSlot>,
    /// Accumulator, one lane per output sample; holds sums of
    /// `sample × Q4.12 gain` products.
    mix_bus: Vec<i64>,
    /// Resampler staging, stereo interleaved.
    scratch: Vec<i16>,
    /// xorshift32 state for output dither.
    dither_state: u32,
}

impl AudioMixer {
    pub fn new(frame_count: usize, device_rate: u32) -> Self {
        Self {
            frame_count,
            device_rate,
            slots: (0..MAX_TRACKS).map(|_| TrackSlot::vacant()).collect(),
            mix_bus: vec![0; frame_count * 2],
            scratch: vec![0; frame_count * 2],
            dither_state: 0x9e37_79b9,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn device_rate(&self) -> u32 {
        self.device_rate
    }

    /// Claim a free slot. `None` when all slots are taken.
    pub fn allocate_track_name(&mut self) -> Option<usize> {
        let name = self.slots.iter().position(|s| !s.in_use)?;
        let slot = &mut self.slots[name];
        *slot = TrackSlot::vacant();
        slot.in_use = true;
        slot.sample_rate = self.device_rate;
        trace!("mixer allocated track name {}", name);
        Some(name)
    }

    pub fn release(&mut self, name: usize) -> MixResult<()> {
        let slot = self.slot_mut(name)?;
        *slot = TrackSlot::vacant();
        Ok(())
    }

    pub fn enable(&mut self, name: usize) -> MixResult<()> {
        self.slot_mut(name)?.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self, name: usize) -> MixResult<()> {
        self.slot_mut(name)?.enabled = false;
        Ok(())
    }

    pub fn is_enabled(&self, name: usize) -> bool {
        self.slots
            .get(name)
            .map(|s| s.in_use && s.enabled)
            .unwrap_or(false)
    }

    pub fn set_buffer_provider(
        &mut self,
        name: usize,
        provider: Option<Arc<dyn BufferProvider>>,
    ) -> MixResult<()> {
        self.slot_mut(name)?.provider = provider;
        Ok(())
    }

    pub fn set_channel_count(&mut self, name: usize, channels: u16) -> MixResult<()> {
        if channels == 0 || channels > 2 {
            return Err(MixError::InvalidChannelCount(channels));
        }
        let slot = self.slot_mut(name)?;
        slot.channels = channels;
        if let Some(resampler) = slot.resampler.as_mut() {
            resampler.set_channels(channels);
        }
        Ok(())
    }

    /// Set the track's input rate. Rates above twice the device rate are
    /// rejected; a rate differing from the device engages a per-slot
    /// resampler.
    pub fn set_sample_rate(&mut self, name: usize, rate: u32) -> MixResult<()> {
        if rate == 0 || rate > self.device_rate * 2 {
            return Err(MixError::InvalidSampleRate(rate));
        }
        let device_rate = self.device_rate;
        let slot = self.slot_mut(name)?;
        slot.sample_rate = rate;
        if rate == device_rate {
            slot.resampler = None;
        } else {
            match slot.resampler.as_mut() {
                Some(r) => r.set_rates(rate, device_rate),
                None => {
                    slot.resampler = Some(LinearResampler::new(rate, device_rate, slot.channels))
                }
            }
        }
        Ok(())
    }

    /// Program left/right gains in Q4.12. With `ramp` the change spreads
    /// linearly over the next `process()` block; without it the new
    /// value applies from the first frame.
    pub fn set_volume(&mut self, name: usize, left: i32, right: i32, ramp: bool) -> MixResult<()> {
        let frames = self.frame_count;
        let slot = self.slot_mut(name)?;
        let left = left.clamp(0, MAX_GAIN);
        let right = right.clamp(0, MAX_GAIN);
        if ramp {
            slot.gain[0].ramp_to(left, frames);
            slot.gain[1].ramp_to(right, frames);
        } else {
            slot.gain[0].set(left);
            slot.gain[1].set(right);
        }
        Ok(())
    }

    /// Mix one block: exactly `frame_count` interleaved stereo frames
    /// into `out`.
    pub fn process(&mut self, out: &mut [i16]) {
        debug_assert_eq!(out.len(), self.frame_count * 2);

        let frame_count = self.frame_count;
        let Self {
            slots,
            mix_bus,
            scratch,
            dither_state,
            ..
        } = self;
        mix_bus.fill(0);

        for slot in slots.iter_mut() {
            if !slot.in_use || !slot.enabled {
                continue;
            }
            let Some(provider) = slot.provider.as_ref() else {
                continue;
            };
            match slot.resampler.as_mut() {
                Some(resampler) => {
                    let produced = resampler.resample(scratch, frame_count, provider.as_ref());
                    for f in 0..produced {
                        let gl = slot.gain[0].next() as i64;
                        let gr = slot.gain[1].next() as i64;
                        mix_bus[f * 2] += scratch[f * 2] as i64 * gl;
                        mix_bus[f * 2 + 1] += scratch[f * 2 + 1] as i64 * gr;
                    }
                }
                None => {
                    let ch = slot.channels as usize;
                    let mut done = 0;
                    while done < frame_count {
                        let chunk = match provider.get_next_buffer(frame_count - done) {
                            Ok(c) => c,
                            Err(_) => break,
                        };
                        let frames = chunk.frames.min(frame_count - done);
                        if frames == 0 {
                            break;
                        }
                        for f in 0..frames {
                            let gl = slot.gain[0].next() as i64;
                            let gr = slot.gain[1].next() as i64;
                            let base = f * ch;
                            let left = chunk.data[base] as i64;
                            let right = if ch >= 2 {
                                chunk.data[base + 1] as i64
                            } else {
                                left
                            };
                            let lane = (done + f) * 2;
                            mix_bus[lane] += left * gl;
                            mix_bus[lane + 1] += right * gr;
                        }
                        provider.release_buffer(frames);
                        done += frames;
                    }
                }
            }
        }

        // Rectangular dither at one quantization step, then clamp. The
        // dither replaces the rounding constant, so silence stays silent.
        for (dst, &acc) in out.iter_mut().zip(mix_bus.iter()) {
            *dither_state ^= *dither_state << 13;
            *dither_state ^= *dither_state >> 17;
            *dither_state ^= *dither_state << 5;
            let dither = (*dither_state & 0xfff) as i64;
            *dst = ((acc + dither) >> 12).clamp(i16::MIN as i64, i16::MAX as i64) as i16;
        }
    }

    fn slot_mut(&mut self, name: usize) -> MixResult<&mut TrackSlot> {
        let slot = self
            .slots
            .get_mut(name)
            .ok_or(MixError::InvalidName(name))?;
        if !slot.in_use {
            return Err(MixError::NameNotAllocated(name));
        }
        Ok(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::UNITY_GAIN;
    use parking_lot::Mutex;

    /// Provider over an owned buffer, shared with the test.
    struct TestProvider {
        data: Vec<i16>,
        channels: usize,
        pos: Mutex<usize>,
    }

    impl TestProvider {
        fn new(data: Vec<i16>, channels: usize) -> Arc<Self> {
            Arc::new(Self {
                data,
                channels,
                pos: Mutex::new(0),
            })
        }
    }

    impl BufferProvider for TestProvider {
        fn get_next_buffer(&self, max_frames: usize) -> MixResult<crate::buffer::AudioChunk<'_>> {
            let pos = *self.pos.lock();
            let available = self.data.len() / self.channels - pos;
            if available == 0 {
                return Err(MixError::NotEnoughData);
            }
            let frames = available.min(max_frames);
            let start = pos * self.channels;
            Ok(crate::buffer::AudioChunk {
                data: &self.data[start..start + frames * self.channels],
                frames,
            })
        }

        fn release_buffer(&self, frames: usize) {
            *self.pos.lock() += frames;
        }
    }

    fn mixer_with_track(frame_count: usize) -> (AudioMixer, usize) {
        let mut mixer = AudioMixer::new(frame_count, 48000);
        let name = mixer.allocate_track_name().unwrap();
        mixer.enable(name).unwrap();
        mixer
            .set_volume(name, UNITY_GAIN, UNITY_GAIN, false)
            .unwrap();
        (mixer, name)
    }

    #[test]
    fn test_slot_exhaustion() {
        let mut mixer = AudioMixer::new(64, 48000);
        for _ in 0..MAX_TRACKS {
            assert!(mixer.allocate_track_name().is_some());
        }
        assert!(mixer.allocate_track_name().is_none());

        mixer.release(7).unwrap();
        assert_eq!(mixer.allocate_track_name(), Some(7));
    }

    #[test]
    fn test_unity_passthrough() {
        let (mut mixer, name) = mixer_with_track(8);
        let samples: Vec<i16> = (1..=16).map(|i| i * 100).collect();
        mixer
            .set_buffer_provider(name, Some(TestProvider::new(samples.clone(), 2)))
            .unwrap();

        let mut out = vec![0i16; 16];
        mixer.process(&mut out);
        // Dither can nudge a sample by at most one LSB.
        for (got, want) in out.iter().zip(samples.iter()) {
            assert!((got - want).abs() <= 1, "{got} vs {want}");
        }
    }

    #[test]
    fn test_two_tracks_sum() {
        let (mut mixer, a) = mixer_with_track(4);
        let b = mixer.allocate_track_name().unwrap();
        mixer.enable(b).unwrap();
        mixer.set_volume(b, UNITY_GAIN, UNITY_GAIN, false).unwrap();

        mixer
            .set_buffer_provider(a, Some(TestProvider::new(vec![1000; 8], 2)))
            .unwrap();
        mixer
            .set_buffer_provider(b, Some(TestProvider::new(vec![500; 8], 2)))
            .unwrap();

        let mut out = vec![0i16; 8];
        mixer.process(&mut out);
        for s in out {
            assert!((s - 1500).abs() <= 1, "{s}");
        }
    }

    #[test]
    fn test_clamp_at_full_scale() {
        let (mut mixer, a) = mixer_with_track(4);
        let b = mixer.allocate_track_name().unwrap();
        mixer.enable(b).unwrap();
        mixer.set_volume(b, UNITY_GAIN, UNITY_GAIN, false).unwrap();

        mixer
            .set_buffer_provider(a, Some(TestProvider::new(vec![30000; 8], 2)))
            .unwrap();
        mixer
            .set_buffer_provider(b, Some(TestProvider::new(vec![30000; 8], 2)))
            .unwrap();

        let mut out = vec![0i16; 8];
        mixer.process(&mut out);
        assert!(out.iter().all(|&s| s == i16::MAX));
    }

    #[test]
    fn test_half_gain() {
        let (mut mixer, name) = mixer_with_track(4);
        mixer.set_volume(name, 0x800, 0x800, false).unwrap();
        mixer
            .set_buffer_provider(name, Some(TestProvider::new(vec![1000; 8], 2)))
            .unwrap();

        let mut out = vec![0i16; 8];
        mixer.process(&mut out);
        for s in out {
            assert!((s - 500).abs() <= 1, "{s}");
        }
    }

    #[test]
    fn test_mono_duplicated_to_stereo() {
        let (mut mixer, name) = mixer_with_track(3);
        mixer.set_channel_count(name, 1).unwrap();
        mixer
            .set_buffer_provider(name, Some(TestProvider::new(vec![700, -700, 0], 1)))
            .unwrap();

        let mut out = vec![0i16; 6];
        mixer.process(&mut out);
        assert!((out[0] - out[1]).abs() <= 1);
        assert!((out[2] - out[3]).abs() <= 1);
        assert!((out[0] - 700).abs() <= 1);
    }

    #[test]
    fn test_disabled_track_is_silent() {
        let (mut mixer, name) = mixer_with_track(4);
        mixer
            .set_buffer_provider(name, Some(TestProvider::new(vec![9999; 8], 2)))
            .unwrap();
        mixer.disable(name).unwrap();

        let mut out = vec![1i16; 8];
        mixer.process(&mut out);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_dry_provider_yields_silence() {
        let (mut mixer, name) = mixer_with_track(4);
        mixer
            .set_buffer_provider(name, Some(TestProvider::new(vec![], 2)))
            .unwrap();

        let mut out = vec![1i16; 8];
        mixer.process(&mut out);
        assert!(out.iter().all(|&s| s == 0));
    }

    #[test]
    fn test_short_provider_pads_with_silence() {
        let (mut mixer, name) = mixer_with_track(8);
        mixer
            .set_buffer_provider(name, Some(TestProvider::new(vec![800; 4], 2)))
            .unwrap();

        let mut out = vec![0i16; 16];
        mixer.process(&mut out);
        assert!((out[0] - 800).abs() <= 1);
        assert!((out[3] - 800).abs() <= 1);
        assert!(out[4..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_volume_ramp_is_gradual() {
        let (mut mixer, name) = mixer_with_track(64);
        // Start silent, ramp to unity over the block.
        mixer.set_volume(name, 0, 0, false).unwrap();
        mixer.set_volume(name, UNITY_GAIN, UNITY_GAIN, true).unwrap();
        mixer
            .set_buffer_provider(name, Some(TestProvider::new(vec![20000; 128], 2)))
            .unwrap();

        let mut out = vec![0i16; 128];
        mixer.process(&mut out);
        let first = out[0];
        let last = out[126];
        assert!(first < 2000, "ramp should start near silence: {first}");
        assert!(last > 18000, "ramp should end near unity: {last}");
    }

    #[test]
    fn test_resampled_track_fills_block() {
        let (mut mixer, name) = mixer_with_track(48);
        mixer.set_sample_rate(name, 44100).unwrap();
        mixer
            .set_buffer_provider(name, Some(TestProvider::new(vec![4000; 2 * 100], 2)))
            .unwrap();

        let mut out = vec![0i16; 96];
        mixer.process(&mut out);
        // A constant signal stays constant through linear interpolation.
        for s in out {
            assert!((s - 4000).abs() <= 1, "{s}");
        }
    }

    #[test]
    fn test_resampled_ramp_has_no_group_delay() {
        // A 2x-upsampled ramp lands every output frame exactly on the
        // line; a duplicated leading frame or one-frame delay shifts it.
        let (mut mixer, name) = mixer_with_track(16);
        mixer.set_channel_count(name, 1).unwrap();
        mixer.set_sample_rate(name, 24000).unwrap();
        let ramp: Vec<i16> = (0..64).map(|i| i * 100).collect();
        mixer
            .set_buffer_provider(name, Some(TestProvider::new(ramp, 1)))
            .unwrap();

        let mut out = vec![0i16; 32];
        mixer.process(&mut out);
        for (k, frame) in out.chunks_exact(2).enumerate() {
            let want = (k as i16) * 50;
            assert!(
                (frame[0] - want).abs() <= 1,
                "frame {k}: {} vs {want}",
                frame[0]
            );
            assert!((frame[0] - frame[1]).abs() <= 1);
        }
    }

    #[test]
    fn test_rate_limits() {
        let mut mixer = AudioMixer::new(64, 48000);
        let name = mixer.allocate_track_name().unwrap();
        assert!(mixer.set_sample_rate(name, 96000).is_ok());
        assert_eq!(
            mixer.set_sample_rate(name, 96001),
            Err(MixError::InvalidSampleRate(96001))
        );
        assert_eq!(
            mixer.set_sample_rate(name, 0),
            Err(MixError::InvalidSampleRate(0))
        );
    }

    #[test]
    fn test_operations_on_free_slot_fail() {
        let mut mixer = AudioMixer::new(64, 48000);
        assert_eq!(mixer.enable(3), Err(MixError::NameNotAllocated(3)));
        assert_eq!(mixer.enable(99), Err(MixError::InvalidName(99)));
    }
}
