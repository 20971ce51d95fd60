//! Hardware Stream Traits
//!
//! Defines the interface the server uses to talk to audio hardware.
//! Every backend (null, loopback, cpal) implements these traits; the
//! server never sees anything more specific than a boxed stream.
//!
//! Streams are byte-oriented and *blocking*: `write` returns once the
//! device has accepted the buffer, which is what paces the real-time
//! mixer loop. A backend that cannot block on real hardware must pace
//! writes itself (see the null backend).

use serde::{Deserialize, Serialize};

use crate::error::HalResult;

/// PCM sample encodings the server understands.
///
/// 8-bit PCM exists only at the client API surface; clients up-convert
/// before writing, so hardware streams are always 16-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    Pcm16,
    Pcm8,
}

impl SampleFormat {
    /// Bytes per sample as stored in stream buffers.
    ///
    /// 8-bit PCM is sized as 16-bit: clients up-convert before writing.
    pub fn bytes_per_sample(&self) -> usize {
        2
    }
}

/// Global hardware mode, mirrored to the device by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudioMode {
    Normal,
    Ringtone,
    InCall,
}

/// Negotiated stream parameters
///
/// Passed to `open_output_stream`/`open_input_stream` as a request; the
/// backend may adjust fields it cannot honor and returns the final values
/// through the stream accessors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamProfile {
    /// Sample rate in Hz (e.g., 44100, 48000)
    pub sample_rate: u32,

    /// Number of channels (1 = mono, 2 = stereo)
    pub channels: u16,

    /// Sample encoding
    pub format: SampleFormat,
}

impl Default for StreamProfile {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            channels: 2,
            format: SampleFormat::Pcm16,
        }
    }
}

impl StreamProfile {
    /// Bytes for one frame (one sample per channel).
    pub fn frame_size(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }

    /// Validate against what this server supports (§ non-goals: ≤ 2 ch,
    /// 16-bit linear PCM, sane rates).
    pub fn validate(&self) -> Result<(), String> {
        if self.sample_rate < 4000 || self.sample_rate > 192_000 {
            return Err(format!("invalid sample rate: {}", self.sample_rate));
        }
        if self.channels == 0 || self.channels > 2 {
            return Err(format!("invalid channel count: {}", self.channels));
        }
        Ok(())
    }
}

/// A playback stream bound to one hardware sink.
///
/// The owning endpoint thread is the only caller; implementations may
/// assume single-threaded access.
pub trait OutputStream: Send {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    fn format(&self) -> SampleFormat;

    /// Bytes per frame.
    fn frame_size(&self) -> usize {
        self.channels() as usize * self.format().bytes_per_sample()
    }

    /// Size of one hardware period in bytes. The mixer emits exactly this
    /// much per cycle.
    fn buffer_size(&self) -> usize;

    /// Total sink latency in milliseconds.
    fn latency_ms(&self) -> u32;

    /// Blocking write. Returns the number of bytes accepted.
    fn write(&mut self, buf: &[u8]) -> HalResult<usize>;

    /// Enter the low-power state. The next write wakes the device and
    /// costs about one extra period of latency.
    fn standby(&mut self) -> HalResult<()>;

    /// Driver-side volume, used by pass-through endpoints whose samples
    /// never cross the software mixer. Values are normalized `[0, 1]`.
    fn set_volume(&mut self, left: f32, right: f32) -> HalResult<()>;

    fn set_parameters(&mut self, kv_pairs: &str) -> HalResult<()>;
    fn get_parameters(&self, keys: &str) -> String;
}

/// A capture stream bound to one hardware source.
pub trait InputStream: Send {
    fn sample_rate(&self) -> u32;
    fn channels(&self) -> u16;
    fn format(&self) -> SampleFormat;

    fn frame_size(&self) -> usize {
        self.channels() as usize * self.format().bytes_per_sample()
    }

    /// Size of one hardware period in bytes.
    fn buffer_size(&self) -> usize;

    /// Blocking read. Returns the number of bytes produced.
    fn read(&mut self, buf: &mut [u8]) -> HalResult<usize>;

    fn standby(&mut self) -> HalResult<()>;

    /// Analog input gain, normalized `[0, 1]`.
    fn set_gain(&mut self, gain: f32) -> HalResult<()>;

    fn set_parameters(&mut self, kv_pairs: &str) -> HalResult<()>;
    fn get_parameters(&self, keys: &str) -> String;
}

/// Top-level device object: opens streams and carries the global controls
/// that do not belong to any single stream.
pub trait AudioHardware: Send {
    /// Ready check; the server refuses to start endpoints until this
    /// succeeds.
    fn init_check(&self) -> HalResult<()>;

    fn set_mode(&mut self, mode: AudioMode) -> HalResult<()>;

    /// Hardware master volume. Backends without a master control return
    /// `Ok(())` and let the software mixer handle it.
    fn set_master_volume(&mut self, volume: f32) -> HalResult<()>;

    /// In-call voice volume (only meaningful in `AudioMode::InCall`).
    fn set_voice_volume(&mut self, volume: f32) -> HalResult<()>;

    fn set_mic_mute(&mut self, muted: bool) -> HalResult<()>;
    fn mic_mute(&self) -> bool;

    fn set_parameters(&mut self, kv_pairs: &str) -> HalResult<()>;
    fn get_parameters(&self, keys: &str) -> String;

    /// Preferred capture period in bytes for a profile.
    fn input_buffer_size(&self, profile: &StreamProfile) -> usize;

    /// Open a playback stream on a device bitmask. `None` requests the
    /// backend defaults.
    fn open_output_stream(
        &mut self,
        devices: u32,
        profile: Option<StreamProfile>,
    ) -> HalResult<Box<dyn OutputStream>>;

    /// Open a capture stream on a device bitmask.
    fn open_input_stream(
        &mut self,
        devices: u32,
        profile: Option<StreamProfile>,
    ) -> HalResult<Box<dyn InputStream>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_default() {
        let profile = StreamProfile::default();
        assert_eq!(profile.sample_rate, 44100);
        assert_eq!(profile.channels, 2);
        assert_eq!(profile.frame_size(), 4);
    }

    #[test]
    fn test_profile_validation() {
        assert!(StreamProfile::default().validate().is_ok());

        let bad_rate = StreamProfile {
            sample_rate: 100,
            ..Default::default()
        };
        assert!(bad_rate.validate().is_err());

        let bad_channels = StreamProfile {
            channels: 6,
            ..Default::default()
        };
        assert!(bad_channels.validate().is_err());
    }

    #[test]
    fn test_pcm8_sized_as_pcm16() {
        // Clients up-convert 8-bit data before writing, so frame sizes
        // are computed as if the data were 16-bit.
        let profile = StreamProfile {
            format: SampleFormat::Pcm8,
            channels: 1,
            ..Default::default()
        };
        assert_eq!(profile.frame_size(), 2);
    }

    #[test]
    fn test_profile_serialization() {
        let profile = StreamProfile::default();
        let json = serde_json::to_string(&profile).unwrap();
        let back: StreamProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(profile, back);
    }
}
