//! Shared Server Types
//!
//! Stream categories, endpoint handles, track/output configuration, and
//! the tuning constants of the real-time loops.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use heron_hal::{SampleFormat, StreamProfile};

/// Handle identifying one endpoint (output or input), issued
/// monotonically by the server. Zero is never issued; parameter calls
/// use it to mean "the device itself".
pub type IoHandle = u32;

/// The global parameter target: `set_parameters(GLOBAL_IO_HANDLE, ...)`
/// goes to the hardware instead of an endpoint.
pub const GLOBAL_IO_HANDLE: IoHandle = 0;

/// Stream categories with independent volume and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamType {
    VoiceCall,
    System,
    Ring,
    Music,
    Alarm,
    Notification,
}

impl StreamType {
    pub const COUNT: usize = 6;

    pub fn index(&self) -> usize {
        *self as usize
    }

    pub fn all() -> [StreamType; Self::COUNT] {
        [
            StreamType::VoiceCall,
            StreamType::System,
            StreamType::Ring,
            StreamType::Music,
            StreamType::Alarm,
            StreamType::Notification,
        ]
    }
}

/// Configuration for a client playback track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackConfig {
    pub stream_type: StreamType,
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub channels: u16,
    /// Ring capacity in frames. Zero asks the server to size it from the
    /// endpoint (enough for the endpoint latency).
    pub frame_count: usize,
    /// One-shot mode: the client fills the buffer once and the server
    /// may loop it; the ring never recycles during playback.
    pub static_buffer: bool,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            stream_type: StreamType::Music,
            sample_rate: 44100,
            format: SampleFormat::Pcm16,
            channels: 2,
            frame_count: 0,
            static_buffer: false,
        }
    }
}

/// Configuration for a client record track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    pub sample_rate: u32,
    pub format: SampleFormat,
    pub channels: u16,
    pub frame_count: usize,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            sample_rate: 44100,
            format: SampleFormat::Pcm16,
            channels: 2,
            frame_count: 0,
        }
    }
}

/// Request for a new output endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Hardware device selector bitmask, passed through to the HAL.
    pub devices: u32,
    /// Requested stream parameters; `None` takes the backend defaults.
    pub profile: Option<StreamProfile>,
    /// Pass-through endpoint: one track, no software mixing, hardware
    /// volume.
    pub direct: bool,
}

/// Request for a new input endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    pub devices: u32,
    pub profile: Option<StreamProfile>,
}

/// What an endpoint looks like, reported in config-change events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDescriptor {
    pub sample_rate: u32,
    pub channels: u16,
    pub format: SampleFormat,
    pub frame_count: usize,
    pub latency_ms: u32,
}

/// Counters maintained by an endpoint thread, snapshot for diagnostics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreadStats {
    pub writes: u64,
    pub frames_written: u64,
    pub delayed_writes: u64,
    pub standbys: u64,
    pub underruns: u64,
    pub overflow_drops: u64,
}

// Tuning constants of the real-time loops.

/// Empty consecutive pulls before a steady-state track is evicted.
pub const MAX_TRACK_RETRIES: u32 = 20;

/// Empty consecutive pulls tolerated before the first mix.
pub const MAX_TRACK_STARTUP_RETRIES: u32 = 50;

/// Idle time with no active tracks before the device goes to standby.
pub const STANDBY_DELAY: Duration = Duration::from_secs(3);

/// Recovery sleep bounds for a loop with nothing to mix.
pub const RECOVERY_SLEEP_MIN: Duration = Duration::from_millis(2);
pub const RECOVERY_SLEEP_MAX: Duration = Duration::from_millis(20);

/// Producer-side blocking wait on a full ring.
pub const CBLK_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pending buffers an OutputTrack queues against downstream backpressure
/// before dropping.
pub const MAX_OVERFLOW_BUFFERS: usize = 8;

/// Per-client shared arena budget in bytes.
pub const CLIENT_ARENA_BYTES: usize = 1024 * 1024;
