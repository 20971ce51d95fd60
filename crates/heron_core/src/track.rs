//! Track Model
//!
//! `Track` is one client playback stream attached to an output endpoint;
//! `RecordTrack` is its capture counterpart. The state machine lives
//! here; the endpoint threads orchestrate the transitions while holding
//! their own lock.
//!
//! A `Track` is also the `BufferProvider` the mixer pulls from: the pull
//! side maps straight onto the control block's consumer protocol, with a
//! non-blocking cursor step that records failure instead of corrupting
//! the ring.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use heron_hal::SampleFormat;
use heron_mix::{AudioChunk, BufferProvider, MixError, MixResult};

use crate::cblk::ControlBlock;
use crate::client::Client;
use crate::error::{ServerError, ServerResult};
use crate::types::{StreamType, MAX_TRACK_STARTUP_RETRIES};

/// Mixer slot sentinel for "no name assigned".
pub(crate) const NO_NAME: usize = usize::MAX;

static NEXT_TRACK_ID: AtomicU64 = AtomicU64::new(1);

/// Playback track lifecycle.
///
/// The ordinal order matters: `stop()` applies to every state above
/// `Stopped`, and the set of startable states sits at fixed positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TrackState {
    Idle,
    Terminated,
    Stopped,
    Flushed,
    Paused,
    Pausing,
    Resuming,
    Active,
}

/// Fill-up discipline: a started track stays `Filling` until its ring
/// holds a full buffer (or the client forces readiness), spends one
/// cycle in `Filled` (which selects an instant volume apply instead of a
/// ramp), then runs `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    Filling,
    Filled,
    Ready,
}

pub struct Track {
    id: u64,
    stream_type: StreamType,
    sample_rate: u32,
    channels: u16,
    format: SampleFormat,
    /// OutputTrack feeds from a duplicating endpoint are virtual: they
    /// never belong to a client and stream re-routing skips them.
    is_virtual: bool,
    /// Static one-shot tracks must have written at least this many
    /// frames before the retry counter may evict them.
    min_frames: u64,
    cblk: Arc<ControlBlock>,
    client: Option<Arc<Client>>,

    state: Mutex<TrackState>,
    fill: Mutex<FillStatus>,
    retries: AtomicU32,
    /// Mixer slot on the owning endpoint; `NO_NAME` when unassigned.
    name: AtomicUsize,
    muted: AtomicBool,
    /// The last non-blocking cursor step failed; retry next cycle.
    step_failed: AtomicBool,
    underruns: AtomicU32,
}

impl Track {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        stream_type: StreamType,
        sample_rate: u32,
        channels: u16,
        format: SampleFormat,
        cblk: Arc<ControlBlock>,
        client: Option<Arc<Client>>,
        is_virtual: bool,
        min_frames: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed),
            stream_type,
            sample_rate,
            channels,
            format,
            is_virtual,
            min_frames,
            cblk,
            client,
            state: Mutex::new(TrackState::Idle),
            fill: Mutex::new(FillStatus::Filling),
            retries: AtomicU32::new(MAX_TRACK_STARTUP_RETRIES),
            name: AtomicUsize::new(NO_NAME),
            muted: AtomicBool::new(false),
            step_failed: AtomicBool::new(false),
            underruns: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn cblk(&self) -> &Arc<ControlBlock> {
        &self.cblk
    }

    pub fn state(&self) -> TrackState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: TrackState) {
        *self.state.lock() = state;
    }

    pub fn fill_status(&self) -> FillStatus {
        *self.fill.lock()
    }

    pub(crate) fn set_fill_status(&self, fill: FillStatus) {
        *self.fill.lock() = fill;
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    pub(crate) fn name(&self) -> usize {
        self.name.load(Ordering::Relaxed)
    }

    pub(crate) fn set_name(&self, name: usize) {
        self.name.store(name, Ordering::Relaxed);
    }

    pub(crate) fn retries_left(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_retries(&self, budget: u32) {
        self.retries.store(budget, Ordering::Relaxed);
    }

    /// Decrement the retry budget; true when it just hit zero.
    pub(crate) fn count_retry(&self) -> bool {
        let left = self.retries.load(Ordering::Relaxed);
        if left == 0 {
            return true;
        }
        self.retries.store(left - 1, Ordering::Relaxed);
        left - 1 == 0
    }

    pub fn underrun_count(&self) -> u32 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Static clips may not be evicted before one hardware-latency worth
    /// of frames has been written, so short sounds always play out.
    pub(crate) fn evictable(&self) -> bool {
        if !self.cblk.is_static() {
            return true;
        }
        self.cblk.frames_written() >= self.min_frames
    }

    /// `start()` transition. Returns `true` when the track must be
    /// (re-)inserted into the active list.
    pub(crate) fn begin_start(&self) -> ServerResult<bool> {
        let mut state = self.state.lock();
        match *state {
            TrackState::Terminated => Err(ServerError::InvalidOperation(
                "cannot start a terminated track".into(),
            )),
            TrackState::Active | TrackState::Resuming => Ok(false),
            TrackState::Pausing | TrackState::Paused => {
                *state = TrackState::Resuming;
                Ok(false)
            }
            TrackState::Idle | TrackState::Stopped | TrackState::Flushed => {
                *state = TrackState::Active;
                *self.fill.lock() = FillStatus::Filling;
                self.retries
                    .store(MAX_TRACK_STARTUP_RETRIES, Ordering::Relaxed);
                debug!("track {} starting", self.id);
                Ok(true)
            }
        }
    }

    /// `stop()` transition; true when the caller should reset the ring
    /// because the thread will not drain it.
    pub(crate) fn begin_stop(&self, in_active_list: bool) -> bool {
        let mut state = self.state.lock();
        if *state > TrackState::Stopped {
            *state = TrackState::Stopped;
            debug!("track {} stopped", self.id);
        }
        !in_active_list
    }

    pub(crate) fn begin_pause(&self) {
        let mut state = self.state.lock();
        if matches!(*state, TrackState::Active | TrackState::Resuming) {
            *state = TrackState::Pausing;
            debug!("track {} pausing", self.id);
        }
    }

    pub(crate) fn begin_flush(&self) -> ServerResult<()> {
        let mut state = self.state.lock();
        match *state {
            TrackState::Stopped | TrackState::Paused | TrackState::Pausing => {
                self.cblk.reset();
                *state = TrackState::Flushed;
                *self.fill.lock() = FillStatus::Filling;
                Ok(())
            }
            other => Err(ServerError::InvalidOperation(format!(
                "cannot flush a track in state {:?}",
                other
            ))),
        }
    }

    pub(crate) fn terminate(&self) {
        *self.state.lock() = TrackState::Terminated;
    }

    pub(crate) fn note_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
        self.cblk.raise_flow_control();
    }
}

impl Drop for Track {
    fn drop(&mut self) {
        if let Some(client) = &self.client {
            client.free(self.cblk.size_bytes());
        }
    }
}

impl BufferProvider for Track {
    fn get_next_buffer(&self, max_frames: usize) -> MixResult<AudioChunk<'_>> {
        match self.cblk.obtain_read(max_frames) {
            Some((data, frames)) => Ok(AudioChunk { data, frames }),
            None => Err(MixError::NotEnoughData),
        }
    }

    fn release_buffer(&self, frames: usize) {
        match self.cblk.step_consumer(frames, true) {
            Ok(()) => {
                self.step_failed.store(false, Ordering::Relaxed);
            }
            Err(_) => {
                // Peer holds the block mutex; the cursor stays put and
                // the same frames come back next cycle.
                if !self.step_failed.swap(true, Ordering::Relaxed) {
                    warn!("track {}: consumer step contended, retrying", self.id);
                }
            }
        }
    }
}

/// Capture-side lifecycle; start/stop are synchronous handshakes, so
/// the intermediate states are observable by the waiting caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Idle,
    Starting,
    Active,
    Stopping,
}

pub struct RecordTrack {
    id: u64,
    sample_rate: u32,
    channels: u16,
    format: SampleFormat,
    cblk: Arc<ControlBlock>,
    client: Option<Arc<Client>>,
    state: Mutex<RecordState>,
    overruns: AtomicU32,
}

impl RecordTrack {
    pub(crate) fn new(
        sample_rate: u32,
        channels: u16,
        format: SampleFormat,
        cblk: Arc<ControlBlock>,
        client: Option<Arc<Client>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TRACK_ID.fetch_add(1, Ordering::Relaxed),
            sample_rate,
            channels,
            format,
            cblk,
            client,
            state: Mutex::new(RecordState::Idle),
            overruns: AtomicU32::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn cblk(&self) -> &Arc<ControlBlock> {
        &self.cblk
    }

    pub fn state(&self) -> RecordState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: RecordState) {
        *self.state.lock() = state;
    }

    pub fn overrun_count(&self) -> u32 {
        self.overruns.load(Ordering::Relaxed)
    }

    pub(crate) fn note_overrun(&self) {
        self.overruns.fetch_add(1, Ordering::Relaxed);
        self.cblk.raise_flow_control();
    }
}

impl Drop for RecordTrack {
    fn drop(&mut self) {
        if let Some(client) = &self.client {
            client.free(self.cblk.size_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_track(static_buffer: bool) -> Arc<Track> {
        let cblk = ControlBlock::new(8, 2, SampleFormat::Pcm16, 44100, true, static_buffer);
        Track::new(
            StreamType::Music,
            44100,
            2,
            SampleFormat::Pcm16,
            cblk,
            None,
            false,
            4,
        )
    }

    #[test]
    fn test_start_from_idle() {
        let track = test_track(false);
        assert!(track.begin_start().unwrap());
        assert_eq!(track.state(), TrackState::Active);
        assert_eq!(track.fill_status(), FillStatus::Filling);
        assert_eq!(track.retries_left(), MAX_TRACK_STARTUP_RETRIES);
    }

    #[test]
    fn test_pause_resume_cycle() {
        let track = test_track(false);
        track.begin_start().unwrap();
        track.begin_pause();
        assert_eq!(track.state(), TrackState::Pausing);

        // Thread acknowledges the pause.
        track.set_state(TrackState::Paused);

        assert!(!track.begin_start().unwrap());
        assert_eq!(track.state(), TrackState::Resuming);
    }

    #[test]
    fn test_stop_applies_above_stopped_only() {
        let track = test_track(false);
        track.begin_start().unwrap();
        track.begin_stop(true);
        assert_eq!(track.state(), TrackState::Stopped);

        // Stopping again (or from Idle) changes nothing.
        let idle = test_track(false);
        idle.begin_stop(true);
        assert_eq!(idle.state(), TrackState::Idle);
    }

    #[test]
    fn test_flush_legal_states_only() {
        let track = test_track(false);
        track.begin_start().unwrap();
        assert!(track.begin_flush().is_err());

        track.set_state(TrackState::Paused);
        track.cblk().write(&[1i16; 8], false).unwrap();
        track.begin_flush().unwrap();
        assert_eq!(track.state(), TrackState::Flushed);
        assert_eq!(track.cblk().frames_ready(), 0);

        // Flushed is startable.
        assert!(track.begin_start().unwrap());
    }

    #[test]
    fn test_terminated_is_final() {
        let track = test_track(false);
        track.terminate();
        assert!(track.begin_start().is_err());
        assert_eq!(track.state(), TrackState::Terminated);
    }

    #[test]
    fn test_pause_only_from_running_states() {
        let track = test_track(false);
        track.begin_pause();
        assert_eq!(track.state(), TrackState::Idle);
    }

    #[test]
    fn test_retry_countdown() {
        let track = test_track(false);
        track.reset_retries(2);
        assert!(!track.count_retry());
        assert!(track.count_retry());
        assert!(track.count_retry(), "stays exhausted");
    }

    #[test]
    fn test_static_eviction_guard() {
        let track = test_track(true);
        assert!(!track.evictable(), "nothing written yet");
        track.cblk().write(&[0i16; 2 * 4], false).unwrap();
        assert!(track.evictable(), "min frames written");
    }

    #[test]
    fn test_provider_pull_and_underrun() {
        let track = test_track(false);
        track.cblk().write(&[9i16; 3 * 2], false).unwrap();

        let chunk = track.get_next_buffer(8).unwrap();
        assert_eq!(chunk.frames, 3);
        track.release_buffer(3);

        assert_eq!(
            track.get_next_buffer(8).unwrap_err(),
            MixError::NotEnoughData
        );
    }

    #[test]
    fn test_record_track_states() {
        let cblk = ControlBlock::new(8, 1, SampleFormat::Pcm16, 16000, false, false);
        let rt = RecordTrack::new(16000, 1, SampleFormat::Pcm16, cblk, None);
        assert_eq!(rt.state(), RecordState::Idle);
        rt.set_state(RecordState::Starting);
        rt.set_state(RecordState::Active);
        assert_eq!(rt.state(), RecordState::Active);
    }
}
