//! Null Backend
//!
//! A silent, wall-clock-paced device. Writes are accepted and discarded,
//! but only at the rate real hardware would drain them, so endpoint
//! threads see realistic cadence, standby, and delayed-write behavior
//! without any audio stack present. This is the default backend and the
//! workhorse of the test suite.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{HalError, HalResult};
use crate::traits::{
    AudioHardware, AudioMode, InputStream, OutputStream, SampleFormat, StreamProfile,
};

/// Default period of the fake device, in frames.
const DEFAULT_PERIOD_FRAMES: usize = 1024;

/// Reported sink latency: two periods, like a double-buffered DMA.
const PERIODS_OF_LATENCY: u32 = 2;

pub struct NullHardware {
    mode: AudioMode,
    master_volume: f32,
    mic_muted: bool,
    period_frames: usize,
}

impl NullHardware {
    pub fn new() -> Self {
        Self::with_period(DEFAULT_PERIOD_FRAMES)
    }

    /// Backend whose streams use `period_frames` per hardware period.
    /// Tests use short periods to keep wall-clock time down.
    pub fn with_period(period_frames: usize) -> Self {
        Self {
            mode: AudioMode::Normal,
            master_volume: 1.0,
            mic_muted: false,
            period_frames,
        }
    }
}

impl Default for NullHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHardware for NullHardware {
    fn init_check(&self) -> HalResult<()> {
        Ok(())
    }

    fn set_mode(&mut self, mode: AudioMode) -> HalResult<()> {
        debug!("null hardware mode -> {:?}", mode);
        self.mode = mode;
        Ok(())
    }

    fn set_master_volume(&mut self, volume: f32) -> HalResult<()> {
        self.master_volume = volume.clamp(0.0, 1.0);
        Ok(())
    }

    fn set_voice_volume(&mut self, _volume: f32) -> HalResult<()> {
        Ok(())
    }

    fn set_mic_mute(&mut self, muted: bool) -> HalResult<()> {
        self.mic_muted = muted;
        Ok(())
    }

    fn mic_mute(&self) -> bool {
        self.mic_muted
    }

    fn set_parameters(&mut self, _kv_pairs: &str) -> HalResult<()> {
        Ok(())
    }

    fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }

    fn input_buffer_size(&self, profile: &StreamProfile) -> usize {
        self.period_frames * profile.frame_size()
    }

    fn open_output_stream(
        &mut self,
        _devices: u32,
        profile: Option<StreamProfile>,
    ) -> HalResult<Box<dyn OutputStream>> {
        let profile = profile.unwrap_or_default();
        profile.validate().map_err(HalError::UnsupportedProfile)?;
        Ok(Box::new(NullOutputStream::new(profile, self.period_frames)))
    }

    fn open_input_stream(
        &mut self,
        _devices: u32,
        profile: Option<StreamProfile>,
    ) -> HalResult<Box<dyn InputStream>> {
        let profile = profile.unwrap_or_default();
        profile.validate().map_err(HalError::UnsupportedProfile)?;
        Ok(Box::new(NullInputStream::new(profile, self.period_frames)))
    }
}

/// Paced sink: every accepted write advances a deadline by the time the
/// frames would take to play, and the next write sleeps until then.
pub struct NullOutputStream {
    profile: StreamProfile,
    period_frames: usize,
    next_write: Option<Instant>,
    volume: (f32, f32),
}

impl NullOutputStream {
    fn new(profile: StreamProfile, period_frames: usize) -> Self {
        Self {
            profile,
            period_frames,
            next_write: None,
            volume: (1.0, 1.0),
        }
    }
}

impl OutputStream for NullOutputStream {
    fn sample_rate(&self) -> u32 {
        self.profile.sample_rate
    }

    fn channels(&self) -> u16 {
        self.profile.channels
    }

    fn format(&self) -> SampleFormat {
        self.profile.format
    }

    fn buffer_size(&self) -> usize {
        self.period_frames * self.profile.frame_size()
    }

    fn latency_ms(&self) -> u32 {
        let period_ms =
            (self.period_frames as u64 * 1000 / self.profile.sample_rate as u64) as u32;
        period_ms * PERIODS_OF_LATENCY
    }

    fn write(&mut self, buf: &[u8]) -> HalResult<usize> {
        let frames = buf.len() / self.profile.frame_size();
        let period = Duration::from_secs_f64(frames as f64 / self.profile.sample_rate as f64);

        let now = Instant::now();
        match self.next_write {
            Some(deadline) if deadline > now => {
                std::thread::sleep(deadline - now);
                self.next_write = Some(deadline + period);
            }
            _ => {
                // Coming out of standby (or fell behind): restart pacing.
                self.next_write = Some(now + period);
            }
        }
        Ok(buf.len())
    }

    fn standby(&mut self) -> HalResult<()> {
        debug!("null output entering standby");
        self.next_write = None;
        Ok(())
    }

    fn set_volume(&mut self, left: f32, right: f32) -> HalResult<()> {
        self.volume = (left.clamp(0.0, 1.0), right.clamp(0.0, 1.0));
        Ok(())
    }

    fn set_parameters(&mut self, _kv_pairs: &str) -> HalResult<()> {
        Ok(())
    }

    fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }
}

/// Paced source producing silence.
pub struct NullInputStream {
    profile: StreamProfile,
    period_frames: usize,
    next_read: Option<Instant>,
}

impl NullInputStream {
    fn new(profile: StreamProfile, period_frames: usize) -> Self {
        Self {
            profile,
            period_frames,
            next_read: None,
        }
    }
}

impl InputStream for NullInputStream {
    fn sample_rate(&self) -> u32 {
        self.profile.sample_rate
    }

    fn channels(&self) -> u16 {
        self.profile.channels
    }

    fn format(&self) -> SampleFormat {
        self.profile.format
    }

    fn buffer_size(&self) -> usize {
        self.period_frames * self.profile.frame_size()
    }

    fn read(&mut self, buf: &mut [u8]) -> HalResult<usize> {
        let frames = buf.len() / self.profile.frame_size();
        let period = Duration::from_secs_f64(frames as f64 / self.profile.sample_rate as f64);

        let now = Instant::now();
        match self.next_read {
            Some(deadline) if deadline > now => {
                std::thread::sleep(deadline - now);
                self.next_read = Some(deadline + period);
            }
            _ => {
                self.next_read = Some(now + period);
            }
        }
        buf.fill(0);
        Ok(buf.len())
    }

    fn standby(&mut self) -> HalResult<()> {
        self.next_read = None;
        Ok(())
    }

    fn set_gain(&mut self, _gain: f32) -> HalResult<()> {
        Ok(())
    }

    fn set_parameters(&mut self, _kv_pairs: &str) -> HalResult<()> {
        Ok(())
    }

    fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }
}
