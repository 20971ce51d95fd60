//! Client-Side Track Handles
//!
//! The thin layer a client process holds. A handle owns the track
//! strongly and the endpoint thread weakly; when the endpoint closes,
//! handle operations fail with `BadIndex` instead of keeping the thread
//! alive. Dropping a handle destroys the track: it is detached, marked
//! terminal, and retired once the endpoint acknowledges.
//!
//! PCM moves through the shared control block, not through calls into
//! the server: `write`/`read` here are the client half of the ring
//! protocol. Samples are native-endian signed 16-bit; clients with
//! 8-bit source material up-convert before writing.

use std::sync::{Arc, Weak};

use crate::cblk::ControlBlock;
use crate::error::{ServerError, ServerResult};
use crate::threads::{PlaybackThread, RecordThread};
use crate::track::{RecordTrack, Track};
use crate::types::IoHandle;

pub struct TrackHandle {
    track: Arc<Track>,
    thread: Weak<PlaybackThread>,
    endpoint: IoHandle,
}

impl std::fmt::Debug for TrackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackHandle")
            .field("track_id", &self.track.id())
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl TrackHandle {
    pub(crate) fn new(track: Arc<Track>, thread: Weak<PlaybackThread>, endpoint: IoHandle) -> Self {
        Self {
            track,
            thread,
            endpoint,
        }
    }

    fn thread(&self) -> ServerResult<Arc<PlaybackThread>> {
        self.thread
            .upgrade()
            .ok_or(ServerError::BadIndex(self.endpoint))
    }

    /// The endpoint this track plays on.
    pub fn endpoint(&self) -> IoHandle {
        self.endpoint
    }

    pub fn start(&self) -> ServerResult<()> {
        self.thread()?.start_track(&self.track)
    }

    pub fn stop(&self) -> ServerResult<()> {
        self.thread()?.stop_track(&self.track);
        Ok(())
    }

    pub fn pause(&self) -> ServerResult<()> {
        self.thread()?.pause_track(&self.track);
        Ok(())
    }

    pub fn flush(&self) -> ServerResult<()> {
        self.thread()?.flush_track(&self.track)
    }

    pub fn mute(&self, muted: bool) {
        self.track.set_muted(muted);
    }

    /// Per-track gain, linear floats; stored in the control block in
    /// Q4.12 and folded into the mix as `master × stream × track`.
    pub fn set_volume(&self, left: f32, right: f32) {
        self.track.cblk().set_volume(
            heron_mix::gain_from_float(left),
            heron_mix::gain_from_float(right),
        );
    }

    /// Direct access to the shared block (cursors, flags, loop point).
    pub fn control_block(&self) -> Arc<ControlBlock> {
        Arc::clone(self.track.cblk())
    }

    /// Producer-side write of interleaved frames. Returns frames
    /// accepted; blocking mode parks (bounded) when the ring is full.
    pub fn write(&self, data: &[i16], blocking: bool) -> ServerResult<usize> {
        self.track.cblk().write(data, blocking)
    }

    /// Bypass the fill-up gate for the next start.
    pub fn force_ready(&self) {
        self.track.cblk().set_force_ready();
    }

    /// Loop a static clip back to its start at `end` frames.
    pub fn set_loop(&self, end: usize) -> ServerResult<()> {
        self.track.cblk().set_loop(end)
    }

    pub fn underrun_count(&self) -> u32 {
        self.track.underrun_count()
    }
}

impl Drop for TrackHandle {
    fn drop(&mut self) {
        match self.thread.upgrade() {
            Some(thread) => thread.destroy_track(&self.track),
            // Endpoint already gone; mark terminal for any straggler.
            None => self.track.terminate(),
        }
    }
}

pub struct RecordHandle {
    track: Arc<RecordTrack>,
    thread: Weak<RecordThread>,
    endpoint: IoHandle,
}

impl RecordHandle {
    pub(crate) fn new(
        track: Arc<RecordTrack>,
        thread: Weak<RecordThread>,
        endpoint: IoHandle,
    ) -> Self {
        Self {
            track,
            thread,
            endpoint,
        }
    }

    fn thread(&self) -> ServerResult<Arc<RecordThread>> {
        self.thread
            .upgrade()
            .ok_or(ServerError::BadIndex(self.endpoint))
    }

    pub fn endpoint(&self) -> IoHandle {
        self.endpoint
    }

    /// Blocks until the record loop is running this track.
    pub fn start(&self) -> ServerResult<()> {
        self.thread()?.start_record(&self.track)
    }

    /// Blocks until the record loop has quiesced this track.
    pub fn stop(&self) -> ServerResult<()> {
        self.thread()?.stop_record(&self.track)
    }

    pub fn control_block(&self) -> Arc<ControlBlock> {
        Arc::clone(self.track.cblk())
    }

    /// Consumer-side read of interleaved frames. Returns frames copied.
    pub fn read(&self, data: &mut [i16], blocking: bool) -> ServerResult<usize> {
        self.track.cblk().read(data, blocking)
    }

    pub fn overrun_count(&self) -> u32 {
        self.track.overrun_count()
    }
}

impl Drop for RecordHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.upgrade() {
            thread.destroy_record_track(&self.track);
        }
    }
}
