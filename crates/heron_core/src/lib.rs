//! Heron Core - Audio Server
//!
//! A process-wide audio mediation service: many client PCM streams
//! multiplexed onto a small number of hardware endpoints in real time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Client threads                         │
//! │  TrackHandle::write ──▶ ControlBlock ring (SPSC, lock-free)  │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ cursors + condvar slow path
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │            One real-time thread per endpoint                 │
//! │  Mixer / Direct / Duplicating ──▶ OutputStream::write        │
//! │  RecordThread ◀── InputStream::read                          │
//! └──────────────────────────────────────────────────────────────┘
//!                               ▲
//!                  AudioServer: registry, routing,
//!                  volumes, observer fan-out
//! ```
//!
//! Lock rank (acquire high to low, never reversed): server lock,
//! endpoint thread lock, control-block mutex, hardware lock.

mod cblk;
mod client;
mod error;
mod events;
mod handle;
mod param;
mod server;
mod threads;
mod track;
mod types;
mod volumes;

pub use cblk::ControlBlock;
pub use client::Client;
pub use error::{ServerError, ServerResult};
pub use events::{ConfigObserver, EventDispatcher, IoConfigEvent};
pub use handle::{RecordHandle, TrackHandle};
pub use param::{
    AudioParameters, KEY_CHANNELS, KEY_FORMAT, KEY_FRAME_COUNT, KEY_ROUTING, KEY_SAMPLING_RATE,
};
pub use server::AudioServer;
pub use track::{FillStatus, RecordState, RecordTrack, Track, TrackState};
pub use types::{
    EndpointDescriptor, InputConfig, IoHandle, OutputConfig, RecordConfig, StreamType,
    ThreadStats, TrackConfig, CBLK_WAIT_TIMEOUT, CLIENT_ARENA_BYTES, GLOBAL_IO_HANDLE,
    MAX_OVERFLOW_BUFFERS, MAX_TRACK_RETRIES, MAX_TRACK_STARTUP_RETRIES, RECOVERY_SLEEP_MAX,
    RECOVERY_SLEEP_MIN, STANDBY_DELAY,
};
pub use volumes::StreamVolumes;

// Gain representation shared with the mix pipeline.
pub use heron_mix::{MAX_GAIN, UNITY_GAIN};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let server = AudioServer::new(Box::new(heron_hal::NullHardware::new())).unwrap();
        assert!(server.output_handles().is_empty());
    }
}
