//! Buffer Provider Contract
//!
//! Any pullable audio source (a client track's shared ring, a record
//! thread staging buffer) exposes this pair of operations. The mixer
//! and resampler pull through it and never learn where the samples
//! actually live.
//!
//! # Real-time Safety Contract
//!
//! Implementors MUST follow these rules:
//! - `get_next_buffer` never blocks beyond a non-blocking attempt to
//!   advance cursors; if no frames are ready it returns
//!   `MixError::NotEnoughData` immediately
//! - no heap allocations on either call
//! - returned chunks stay valid until the matching `release_buffer`
//!
//! Violating these rules causes audio dropouts in every stream sharing
//! the endpoint.

use crate::error::{MixError, MixResult};

/// A contiguous run of interleaved 16-bit PCM frames obtained from a
/// provider.
///
/// `data.len() == frames * channels` for the provider's channel count.
#[derive(Debug)]
pub struct AudioChunk<'a> {
    pub data: &'a [i16],
    pub frames: usize,
}

/// Pull interface over any audio source.
///
/// The caller asks for up to `max_frames`, consumes some prefix of the
/// returned chunk, and reports the exact consumption through
/// `release_buffer`. A short chunk is normal (ring wrap); an error means
/// silence for the rest of this cycle.
pub trait BufferProvider: Send + Sync {
    /// Obtain up to `max_frames` contiguous frames.
    fn get_next_buffer(&self, max_frames: usize) -> MixResult<AudioChunk<'_>>;

    /// Report that `frames` frames of the last obtained chunk were
    /// consumed; the provider advances its read cursor by that much.
    fn release_buffer(&self, frames: usize);
}

/// Provider over a borrowed slice, consumed front to back.
///
/// Used by the record path to expose a device staging buffer to the
/// resampler, and by tests.
pub struct SliceProvider<'a> {
    data: &'a [i16],
    channels: usize,
    pos: std::cell::Cell<usize>,
}

impl<'a> SliceProvider<'a> {
    pub fn new(data: &'a [i16], channels: usize) -> Self {
        Self {
            data,
            channels,
            pos: std::cell::Cell::new(0),
        }
    }

    /// Frames not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() / self.channels - self.pos.get()
    }
}

// The Cell is only touched by the single pulling thread; the provider is
// handed out by value and never shared.
unsafe impl Send for SliceProvider<'_> {}
unsafe impl Sync for SliceProvider<'_> {}

impl BufferProvider for SliceProvider<'_> {
    fn get_next_buffer(&self, max_frames: usize) -> MixResult<AudioChunk<'_>> {
        let available = self.remaining();
        if available == 0 {
            return Err(MixError::NotEnoughData);
        }
        let frames = available.min(max_frames);
        let start = self.pos.get() * self.channels;
        Ok(AudioChunk {
            data: &self.data[start..start + frames * self.channels],
            frames,
        })
    }

    fn release_buffer(&self, frames: usize) {
        let available = self.remaining();
        self.pos.set(self.pos.get() + frames.min(available));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_provider_pull() {
        let data: Vec<i16> = (0..20).collect();
        let provider = SliceProvider::new(&data, 2);
        assert_eq!(provider.remaining(), 10);

        let chunk = provider.get_next_buffer(4).unwrap();
        assert_eq!(chunk.frames, 4);
        assert_eq!(chunk.data, &data[0..8]);
        provider.release_buffer(4);

        let chunk = provider.get_next_buffer(100).unwrap();
        assert_eq!(chunk.frames, 6);
        provider.release_buffer(6);

        assert_eq!(
            provider.get_next_buffer(1).unwrap_err(),
            MixError::NotEnoughData
        );
    }

    #[test]
    fn test_partial_release() {
        let data: Vec<i16> = (0..10).collect();
        let provider = SliceProvider::new(&data, 1);

        let chunk = provider.get_next_buffer(10).unwrap();
        assert_eq!(chunk.frames, 10);
        provider.release_buffer(3);

        let chunk = provider.get_next_buffer(10).unwrap();
        assert_eq!(chunk.data[0], 3);
    }

    #[test]
    fn test_release_clamps_to_remaining() {
        let data: Vec<i16> = vec![0; 4];
        let provider = SliceProvider::new(&data, 1);
        provider.release_buffer(100);
        assert_eq!(provider.remaining(), 0);
    }
}
