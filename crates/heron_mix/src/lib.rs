//! Heron Mix - Output Mix Pipeline
//!
//! This crate provides the DSP half of the Heron audio server:
//! - `AudioMixer`: named track slots, per-track gain/rate/channel state,
//!   and a `process()` that emits one interleaved stereo 16-bit block
//! - `LinearResampler`: rate conversion with a Q32 phase accumulator
//! - `BufferProvider`: the pull contract every audio source implements
//! - channel adaptation and fixed-point gain helpers
//!
//! # Architecture
//!
//! The mixer never blocks and never allocates inside `process()`; all
//! track state changes happen between blocks through the named-slot API.
//! Sources that cannot supply a full block contribute silence for the
//! remainder of that block.

mod buffer;
mod channels;
mod error;
mod mixer;
mod resampler;
mod volume;

pub use buffer::{AudioChunk, BufferProvider, SliceProvider};
pub use channels::{mono_to_stereo, stereo_to_mono};
pub use error::{MixError, MixResult};
pub use mixer::{AudioMixer, MAX_TRACKS};
pub use resampler::LinearResampler;
pub use volume::{float_from_gain, gain_from_float, RampedGain, MAX_GAIN, UNITY_GAIN};
