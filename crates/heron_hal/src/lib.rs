//! Heron HAL - Hardware Abstraction Layer
//!
//! This crate defines the narrow interface the audio server uses to talk
//! to playback and capture hardware, plus three backends:
//! - `NullHardware`: silent, wall-clock-paced; the default device
//! - `LoopbackHardware`: output wired to input in-process, for tests
//! - `CpalHardware`: real output through cpal (feature `cpal-backend`)
//!
//! The server side only ever sees `Box<dyn OutputStream>` /
//! `Box<dyn InputStream>` handed out by a `Box<dyn AudioHardware>`.

mod error;
mod loopback;
mod null;
mod traits;

#[cfg(feature = "cpal-backend")]
mod cpal_backend;

pub use error::{HalError, HalResult};
pub use loopback::{LoopbackHardware, LoopbackPipe};
pub use null::NullHardware;
pub use traits::{
    AudioHardware, AudioMode, InputStream, OutputStream, SampleFormat, StreamProfile,
};

#[cfg(feature = "cpal-backend")]
pub use cpal_backend::CpalHardware;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _profile = StreamProfile::default();
        let _hw = NullHardware::new();
    }
}
