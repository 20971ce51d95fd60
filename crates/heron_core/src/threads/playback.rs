//! Playback Endpoint Threads
//!
//! One `PlaybackThread` per output endpoint, in one of three flavors:
//!
//! - `Mixer`: pulls every ready track through the software mixer and
//!   blocking-writes one device period per cycle
//! - `Direct`: single-track pass-through for formats the mixer does not
//!   handle; volume goes to the hardware driver
//! - `Duplicating`: a mixer whose output feeds virtual `OutputTrack`s
//!   on other playback endpoints instead of a device
//!
//! The loop never holds the thread lock across a device write or an
//! observer callback, and it never returns errors upward: short
//! providers become silence, failed writes are retried next cycle,
//! sustained inactivity ends in device standby.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use heron_hal::{OutputStream, SampleFormat};
use heron_mix::{float_from_gain, gain_from_float, AudioMixer, BufferProvider};

use crate::cblk::ControlBlock;
use crate::client::Client;
use crate::error::{ServerError, ServerResult};
use crate::events::{EventDispatcher, IoConfigEvent};
use crate::param::{
    AudioParameters, KEY_CHANNELS, KEY_FORMAT, KEY_FRAME_COUNT, KEY_ROUTING, KEY_SAMPLING_RATE,
};
use crate::track::{FillStatus, Track, TrackState, NO_NAME};
use crate::types::{
    EndpointDescriptor, IoHandle, StreamType, TrackConfig, ThreadStats, MAX_OVERFLOW_BUFFERS,
    MAX_TRACK_RETRIES, RECOVERY_SLEEP_MAX, RECOVERY_SLEEP_MIN, STANDBY_DELAY,
};
use crate::volumes::StreamVolumes;

use super::ThreadStatsAtomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PlaybackKind {
    Mixer,
    Direct,
    Duplicating,
}

pub(crate) struct PlaybackThread {
    id: IoHandle,
    kind: PlaybackKind,
    channels: u16,
    format: SampleFormat,
    sample_rate: AtomicU32,
    frame_count: AtomicUsize,
    latency_ms: AtomicU32,

    state: Mutex<PlaybackState>,
    work_cv: Condvar,
    param_cv: Condvar,
    exit_pending: AtomicBool,
    in_standby: AtomicBool,
    suspend_count: AtomicU32,

    volumes: Arc<StreamVolumes>,
    dispatcher: Arc<EventDispatcher>,
    silent_mode: Arc<AtomicBool>,

    peak_bits: [AtomicU32; 2],
    pub(crate) stats: ThreadStatsAtomic,
    join: Mutex<Option<JoinHandle<()>>>,
}

struct PlaybackState {
    mixer: Option<AudioMixer>,
    tracks: Vec<Arc<Track>>,
    active: Vec<Arc<Track>>,
    param_requests: VecDeque<String>,
    param_result: Option<ServerResult<()>>,
    pending_events: VecDeque<IoConfigEvent>,
    /// Duplicating fan-out.
    outputs: Vec<Arc<OutputTrack>>,
    /// Direct flavor: last gains actually handed to the driver, and the
    /// values waiting to be applied outside the lock.
    direct_applied_volume: (f32, f32),
    direct_pending_volume: Option<(f32, f32)>,
}

impl PlaybackThread {
    /// Spawn a device-backed playback thread (mixer or direct flavor).
    pub fn spawn(
        id: IoHandle,
        kind: PlaybackKind,
        stream: Box<dyn OutputStream>,
        volumes: Arc<StreamVolumes>,
        dispatcher: Arc<EventDispatcher>,
        silent_mode: Arc<AtomicBool>,
    ) -> ServerResult<Arc<Self>> {
        debug_assert!(kind != PlaybackKind::Duplicating);
        let frame_count = stream.buffer_size() / stream.frame_size();
        let thread = Self::build(
            id,
            kind,
            stream.sample_rate(),
            stream.channels(),
            stream.format(),
            frame_count,
            stream.latency_ms(),
            volumes,
            dispatcher,
            silent_mode,
        );
        thread.queue_event(IoConfigEvent::OutputOpened {
            handle: id,
            descriptor: thread.descriptor(),
        });
        Self::launch(&thread, Some(stream))?;
        Ok(thread)
    }

    /// Spawn a duplicating thread; it inherits the mix format of its
    /// primary destination and owns no device.
    pub fn spawn_duplicating(
        id: IoHandle,
        sample_rate: u32,
        frame_count: usize,
        latency_ms: u32,
        volumes: Arc<StreamVolumes>,
        dispatcher: Arc<EventDispatcher>,
        silent_mode: Arc<AtomicBool>,
    ) -> ServerResult<Arc<Self>> {
        let thread = Self::build(
            id,
            PlaybackKind::Duplicating,
            sample_rate,
            2,
            SampleFormat::Pcm16,
            frame_count,
            latency_ms,
            volumes,
            dispatcher,
            silent_mode,
        );
        thread.queue_event(IoConfigEvent::OutputOpened {
            handle: id,
            descriptor: thread.descriptor(),
        });
        Self::launch(&thread, None)?;
        Ok(thread)
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        id: IoHandle,
        kind: PlaybackKind,
        sample_rate: u32,
        channels: u16,
        format: SampleFormat,
        frame_count: usize,
        latency_ms: u32,
        volumes: Arc<StreamVolumes>,
        dispatcher: Arc<EventDispatcher>,
        silent_mode: Arc<AtomicBool>,
    ) -> Arc<Self> {
        let mixer = match kind {
            PlaybackKind::Direct => None,
            _ => Some(AudioMixer::new(frame_count, sample_rate)),
        };
        Arc::new(Self {
            id,
            kind,
            channels,
            format,
            sample_rate: AtomicU32::new(sample_rate),
            frame_count: AtomicUsize::new(frame_count),
            latency_ms: AtomicU32::new(latency_ms),
            state: Mutex::new(PlaybackState {
                mixer,
                tracks: Vec::new(),
                active: Vec::new(),
                param_requests: VecDeque::new(),
                param_result: None,
                pending_events: VecDeque::new(),
                outputs: Vec::new(),
                direct_applied_volume: (-1.0, -1.0),
                direct_pending_volume: None,
            }),
            work_cv: Condvar::new(),
            param_cv: Condvar::new(),
            exit_pending: AtomicBool::new(false),
            in_standby: AtomicBool::new(true),
            suspend_count: AtomicU32::new(0),
            volumes,
            dispatcher,
            silent_mode,
            peak_bits: [AtomicU32::new(0), AtomicU32::new(0)],
            stats: ThreadStatsAtomic::default(),
            join: Mutex::new(None),
        })
    }

    fn launch(
        thread: &Arc<Self>,
        stream: Option<Box<dyn OutputStream>>,
    ) -> ServerResult<()> {
        let runner = Arc::clone(thread);
        let handle = std::thread::Builder::new()
            .name(format!("heron-output-{}", thread.id))
            .spawn(move || run_playback(runner, stream))
            .map_err(|e| ServerError::InvalidOperation(format!("spawn failed: {e}")))?;
        *thread.join.lock() = Some(handle);
        Ok(())
    }

    pub fn id(&self) -> IoHandle {
        self.id
    }

    pub fn kind(&self) -> PlaybackKind {
        self.kind
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count.load(Ordering::Relaxed)
    }

    pub fn latency_ms(&self) -> u32 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    pub fn is_standby(&self) -> bool {
        self.in_standby.load(Ordering::Relaxed)
    }

    pub fn descriptor(&self) -> EndpointDescriptor {
        EndpointDescriptor {
            sample_rate: self.sample_rate(),
            channels: self.channels,
            format: self.format,
            frame_count: self.frame_count(),
            latency_ms: self.latency_ms(),
        }
    }

    pub fn stats(&self) -> ThreadStats {
        self.stats.snapshot()
    }

    /// Post-mix peak levels, normalized `[0, 1]`.
    pub fn peaks(&self) -> (f32, f32) {
        (
            f32::from_bits(self.peak_bits[0].load(Ordering::Relaxed)),
            f32::from_bits(self.peak_bits[1].load(Ordering::Relaxed)),
        )
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().tracks.len()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    /// Create a client track on this endpoint.
    pub fn create_track(
        &self,
        client: Option<Arc<Client>>,
        config: &TrackConfig,
    ) -> ServerResult<Arc<Track>> {
        self.create_track_inner(client, config, false)
    }

    fn create_track_inner(
        &self,
        client: Option<Arc<Client>>,
        config: &TrackConfig,
        is_virtual: bool,
    ) -> ServerResult<Arc<Track>> {
        let device_rate = self.sample_rate();
        if config.channels == 0 || config.channels > 2 {
            return Err(ServerError::InvalidArgument(format!(
                "channel count {}",
                config.channels
            )));
        }
        match self.kind {
            PlaybackKind::Direct => {
                if config.sample_rate != device_rate
                    || config.channels != self.channels
                    || config.format != self.format
                {
                    return Err(ServerError::InvalidArgument(
                        "direct endpoint requires matching rate/format/channels".into(),
                    ));
                }
            }
            _ => {
                if config.sample_rate == 0 || config.sample_rate > device_rate * 2 {
                    return Err(ServerError::InvalidArgument(format!(
                        "sample rate {} exceeds 2x device rate {}",
                        config.sample_rate, device_rate
                    )));
                }
            }
        }

        let frame_count = if config.frame_count > 0 {
            config.frame_count
        } else {
            // Two device periods scaled to the track rate.
            let dev_fc = self.frame_count() as u64;
            ((2 * dev_fc * config.sample_rate as u64) / device_rate as u64).max(64) as usize
        };

        let cblk = ControlBlock::new(
            frame_count,
            config.channels,
            config.format,
            config.sample_rate,
            true,
            config.static_buffer,
        );
        if let Some(client) = &client {
            client.allocate(cblk.size_bytes())?;
        }
        let min_frames = self.latency_ms() as u64 * config.sample_rate as u64 / 1000;
        let track = Track::new(
            config.stream_type,
            config.sample_rate,
            config.channels,
            config.format,
            cblk,
            client,
            is_virtual,
            min_frames,
        );

        let mut st = self.state.lock();
        if let Some(mixer) = st.mixer.as_mut() {
            let name = mixer
                .allocate_track_name()
                .ok_or_else(|| ServerError::NoMemory("no free mixer slots".into()))?;
            track.set_name(name);
            mixer.set_buffer_provider(name, Some(track.clone() as Arc<dyn BufferProvider>))?;
            mixer.set_channel_count(name, config.channels)?;
            mixer.set_sample_rate(name, config.sample_rate)?;
        }
        st.tracks.push(track.clone());
        debug!(
            "endpoint {}: created track {} ({:?}, {} Hz, {} ch, {} frames)",
            self.id,
            track.id(),
            config.stream_type,
            config.sample_rate,
            config.channels,
            frame_count
        );
        Ok(track)
    }

    pub fn start_track(&self, track: &Arc<Track>) -> ServerResult<()> {
        let mut st = self.state.lock();
        track.begin_start()?;
        if !st.active.iter().any(|t| t.id() == track.id()) {
            st.active.push(track.clone());
        }
        drop(st);
        self.work_cv.notify_all();
        Ok(())
    }

    pub fn stop_track(&self, track: &Arc<Track>) {
        let st = self.state.lock();
        let in_active = st.active.iter().any(|t| t.id() == track.id());
        if track.begin_stop(in_active) {
            // Not on the active list: the loop will never drain it.
            track.cblk().reset();
        }
    }

    pub fn pause_track(&self, track: &Arc<Track>) {
        let _st = self.state.lock();
        track.begin_pause();
    }

    pub fn flush_track(&self, track: &Arc<Track>) -> ServerResult<()> {
        let mut st = self.state.lock();
        track.begin_flush()?;
        st.active.retain(|t| t.id() != track.id());
        Ok(())
    }

    /// Client handle dropped: detach and retire the track.
    pub fn destroy_track(&self, track: &Arc<Track>) {
        let mut st = self.state.lock();
        track.terminate();
        st.active.retain(|t| t.id() != track.id());
        if let Some(pos) = st.tracks.iter().position(|t| t.id() == track.id()) {
            let t = st.tracks.remove(pos);
            release_mixer_name(&mut st, &t);
        }
        drop(st);
        self.work_cv.notify_all();
    }

    /// Detach all non-virtual tracks of `stream`, preserving their
    /// active status, for re-routing to another endpoint.
    pub fn take_tracks(&self, stream: StreamType) -> Vec<(Arc<Track>, bool)> {
        let mut st = self.state.lock();
        let mut moved = Vec::new();
        let taken: Vec<Arc<Track>> = st
            .tracks
            .iter()
            .filter(|t| t.stream_type() == stream && !t.is_virtual())
            .cloned()
            .collect();
        for t in taken {
            let was_active = st.active.iter().any(|a| a.id() == t.id());
            st.active.retain(|a| a.id() != t.id());
            st.tracks.retain(|a| a.id() != t.id());
            release_mixer_name(&mut st, &t);
            moved.push((t, was_active));
        }
        moved
    }

    /// Attach re-routed tracks, assigning fresh mixer names.
    pub fn put_tracks(&self, moved: Vec<(Arc<Track>, bool)>) {
        let mut st = self.state.lock();
        for (track, was_active) in moved {
            if let Some(mixer) = st.mixer.as_mut() {
                match mixer.allocate_track_name() {
                    Some(name) => {
                        track.set_name(name);
                        let _ = mixer
                            .set_buffer_provider(name, Some(track.clone() as Arc<dyn BufferProvider>));
                        let _ = mixer.set_channel_count(name, track.channels());
                        let _ = mixer.set_sample_rate(name, track.cblk().sample_rate());
                    }
                    None => {
                        error!(
                            "endpoint {}: no mixer slot for moved track {}",
                            self.id,
                            track.id()
                        );
                        track.set_name(NO_NAME);
                    }
                }
            }
            st.tracks.push(track.clone());
            if was_active && !st.active.iter().any(|a| a.id() == track.id()) {
                st.active.push(track);
            }
        }
        drop(st);
        self.work_cv.notify_all();
    }

    /// Duplicating flavor: wire a new destination endpoint in.
    pub fn add_output_thread(&self, dest: &Arc<PlaybackThread>) -> ServerResult<()> {
        if self.kind != PlaybackKind::Duplicating {
            return Err(ServerError::InvalidOperation(
                "not a duplicating endpoint".into(),
            ));
        }
        // The OutputTrack is created on the destination (its lock), then
        // registered under ours; the two locks never nest.
        let output = OutputTrack::new(dest.clone(), self.sample_rate(), self.frame_count())?;
        self.state.lock().outputs.push(output);
        self.work_cv.notify_all();
        Ok(())
    }

    /// Duplicating flavor: unwire a destination. Stops the output track
    /// only after our own lock is released (the stop takes the
    /// destination thread's lock, a lower rank is not available here).
    pub fn remove_output_thread(&self, dest_id: IoHandle) {
        let removed: Vec<Arc<OutputTrack>> = {
            let mut st = self.state.lock();
            let (gone, keep) = st
                .outputs
                .drain(..)
                .partition(|o| o.dest_id() == dest_id);
            st.outputs = keep;
            gone
        };
        for output in removed {
            output.stop();
            output.destroy();
        }
    }

    pub fn output_count(&self) -> usize {
        self.state.lock().outputs.len()
    }

    /// Synchronous parameter handshake with the loop.
    pub fn set_parameters(&self, kv_pairs: &str) -> ServerResult<()> {
        let mut st = self.state.lock();
        st.param_requests.push_back(kv_pairs.to_string());
        self.work_cv.notify_all();
        loop {
            if let Some(result) = st.param_result.take() {
                return result;
            }
            if self
                .param_cv
                .wait_for(&mut st, Duration::from_secs(2))
                .timed_out()
            {
                return Err(ServerError::WouldBlock);
            }
        }
    }

    pub fn get_parameters(&self, keys: &str) -> String {
        let request = AudioParameters::parse(keys);
        let mut reply = AudioParameters::new();
        for key in request.keys() {
            match key {
                KEY_SAMPLING_RATE => {
                    reply.add(KEY_SAMPLING_RATE, self.sample_rate());
                }
                KEY_CHANNELS => {
                    reply.add(KEY_CHANNELS, self.channels);
                }
                KEY_FRAME_COUNT => {
                    reply.add(KEY_FRAME_COUNT, self.frame_count());
                }
                KEY_FORMAT => {
                    reply.add(KEY_FORMAT, format!("{:?}", self.format));
                }
                _ => {}
            }
        }
        reply.to_string()
    }

    pub fn suspend(&self) {
        self.suspend_count.fetch_add(1, Ordering::Relaxed);
        self.work_cv.notify_all();
    }

    pub fn restore(&self) {
        let prev = self.suspend_count.load(Ordering::Relaxed);
        if prev > 0 {
            self.suspend_count.store(prev - 1, Ordering::Relaxed);
        }
        self.work_cv.notify_all();
    }

    /// Ask the loop to exit and wait for it.
    pub fn exit(&self) {
        self.exit_pending.store(true, Ordering::Release);
        self.work_cv.notify_all();
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn queue_event(&self, event: IoConfigEvent) {
        self.state.lock().pending_events.push_back(event);
    }

    /// Deliver queued config events with no thread lock held.
    fn dispatch_pending_events(&self) {
        loop {
            let event = self.state.lock().pending_events.pop_front();
            match event {
                Some(event) => self.dispatcher.dispatch(&event),
                None => break,
            }
        }
    }
}

fn release_mixer_name(st: &mut PlaybackState, track: &Arc<Track>) {
    if let Some(mixer) = st.mixer.as_mut() {
        let name = track.name();
        if name != NO_NAME {
            let _ = mixer.set_buffer_provider(name, None);
            let _ = mixer.release(name);
            track.set_name(NO_NAME);
        }
    }
}

/// View a PCM buffer as raw bytes for the HAL write call.
fn as_bytes(buf: &[i16]) -> &[u8] {
    // SAFETY: plain reinterpretation of initialized i16 data; u8 has no
    // alignment requirement.
    unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, buf.len() * 2) }
}

fn run_playback(thread: Arc<PlaybackThread>, mut stream: Option<Box<dyn OutputStream>>) {
    let mut frame_count = thread.frame_count();
    let out_channels = thread.channels as usize;
    let mut mix_buf: Vec<i16> = vec![0; frame_count * out_channels];
    let mut sleep_time = RECOVERY_SLEEP_MIN;
    let mut standby_deadline = Instant::now() + STANDBY_DELAY;
    let mut device_standby = true;
    info!("playback thread {} running ({:?})", thread.id, thread.kind);

    loop {
        thread.dispatch_pending_events();

        let mut do_write = false;
        let mut outputs_snapshot: Vec<Arc<OutputTrack>> = Vec::new();
        let mut pending_volume = None;
        {
            let mut st = thread.state.lock();
            if thread.exit_pending.load(Ordering::Acquire) {
                break;
            }

            while let Some(kv) = st.param_requests.pop_front() {
                let result = apply_parameters(
                    &thread,
                    &mut st,
                    stream.as_deref_mut(),
                    &kv,
                    &mut mix_buf,
                    &mut frame_count,
                );
                st.param_result = Some(result);
                thread.param_cv.notify_all();
            }

            let suspended = thread.suspend_count.load(Ordering::Relaxed) > 0;
            if st.active.is_empty() || suspended {
                if suspended || Instant::now() >= standby_deadline {
                    if !device_standby {
                        if let Some(s) = stream.as_mut() {
                            let _ = s.standby();
                        }
                        device_standby = true;
                        thread.in_standby.store(true, Ordering::Relaxed);
                        ThreadStatsAtomic::bump(&thread.stats.standbys);
                        debug!("playback thread {} entering standby", thread.id);
                    }
                    thread.work_cv.wait(&mut st);
                    // One-shot policy hook on the first wake after sleep:
                    // an asserted silent mode forces master mute, and this
                    // path never clears it.
                    if thread.silent_mode.load(Ordering::Relaxed) {
                        thread.volumes.set_master_mute(true);
                    }
                    standby_deadline = Instant::now() + STANDBY_DELAY;
                    sleep_time = RECOVERY_SLEEP_MIN;
                    continue;
                }
            }

            if !st.active.is_empty() && !suspended {
                do_write = match thread.kind {
                    PlaybackKind::Direct => {
                        prepare_direct(&thread, &mut st, frame_count, &mut mix_buf)
                    }
                    _ => prepare_and_mix(&thread, &mut st, frame_count, &mut mix_buf),
                };
            }
            if thread.kind == PlaybackKind::Duplicating {
                outputs_snapshot = st.outputs.clone();
            }
            pending_volume = st.direct_pending_volume.take();
        }

        if do_write {
            // One-shot policy hook on the first wake out of standby: an
            // asserted silent mode forces master mute, and this path
            // never clears it.
            if device_standby && thread.silent_mode.load(Ordering::Relaxed) {
                thread.volumes.set_master_mute(true);
            }
            update_peaks(&thread, &mix_buf);
            match thread.kind {
                PlaybackKind::Duplicating => {
                    for output in &outputs_snapshot {
                        if !output.write(&mix_buf, frame_count) {
                            ThreadStatsAtomic::bump(&thread.stats.overflow_drops);
                        }
                    }
                }
                _ => {
                    let stream = stream.as_mut().expect("device flavor owns a stream");
                    if let Some((left, right)) = pending_volume {
                        let _ = stream.set_volume(left, right);
                    }
                    let period = Duration::from_secs_f64(
                        frame_count as f64 / thread.sample_rate() as f64,
                    );
                    let started = Instant::now();
                    match stream.write(as_bytes(&mix_buf)) {
                        Ok(_) => {}
                        Err(e) => {
                            // Transient device trouble: keep cadence and
                            // retry next cycle.
                            warn!("playback thread {} write failed: {}", thread.id, e);
                            std::thread::sleep(period);
                        }
                    }
                    if started.elapsed() > period * 2 {
                        ThreadStatsAtomic::bump(&thread.stats.delayed_writes);
                        warn!(
                            "playback thread {}: delayed write ({:?} for a {:?} period)",
                            thread.id,
                            started.elapsed(),
                            period
                        );
                    }
                }
            }
            ThreadStatsAtomic::bump(&thread.stats.writes);
            thread
                .stats
                .frames_written
                .fetch_add(frame_count as u64, Ordering::Relaxed);
            device_standby = false;
            thread.in_standby.store(false, Ordering::Relaxed);
            standby_deadline = Instant::now() + STANDBY_DELAY;
            sleep_time = RECOVERY_SLEEP_MIN;
        } else {
            if thread.kind == PlaybackKind::Duplicating {
                // Zero-frame write drains queued overflow toward
                // destinations that caught up.
                for output in &outputs_snapshot {
                    output.write(&[], 0);
                }
            }
            std::thread::sleep(sleep_time);
            sleep_time = (sleep_time * 2).min(RECOVERY_SLEEP_MAX);
        }
    }

    // Exit protocol: quiesce, detach fan-out without nesting locks,
    // deliver the final close event.
    if let Some(s) = stream.as_mut() {
        let _ = s.standby();
    }
    let outputs: Vec<Arc<OutputTrack>> = {
        let mut st = thread.state.lock();
        for track in st.tracks.drain(..) {
            track.terminate();
        }
        st.active.clear();
        st.outputs.drain(..).collect()
    };
    for output in outputs {
        output.stop();
        output.destroy();
    }
    thread.dispatch_pending_events();
    thread
        .dispatcher
        .dispatch(&IoConfigEvent::OutputClosed { handle: thread.id });
    info!("playback thread {} exited", thread.id);
}

/// Walk the active list, program the mixer, and mix one block when at
/// least one track is ready. Holds the thread lock; never blocks.
fn prepare_and_mix(
    thread: &Arc<PlaybackThread>,
    st: &mut PlaybackState,
    frame_count: usize,
    mix_buf: &mut [i16],
) -> bool {
    let mut enabled = 0usize;
    let mut to_remove: Vec<u64> = Vec::new();

    let PlaybackState {
        mixer,
        active,
        tracks,
        ..
    } = st;
    let mixer = mixer.as_mut().expect("mixing flavors own a mixer");

    for track in active.iter() {
        let name = track.name();
        if name == NO_NAME {
            if track.count_retry() {
                to_remove.push(track.id());
            }
            continue;
        }

        if track.state() == TrackState::Pausing {
            track.set_state(TrackState::Paused);
        }
        let state = track.state();
        let cblk = track.cblk();
        let ready = cblk.frames_ready();

        if state == TrackState::Terminated {
            let _ = mixer.disable(name);
            to_remove.push(track.id());
            continue;
        }
        if matches!(state, TrackState::Paused | TrackState::Pausing) {
            // Pause boundary: the slot goes silent. The track lingers on
            // the active list for a fast resume, then ages out so the
            // endpoint can still reach standby.
            let _ = mixer.disable(name);
            if track.count_retry() {
                to_remove.push(track.id());
            }
            continue;
        }
        if state == TrackState::Stopped && ready == 0 {
            // Drained after stop(); drop from the active list.
            let _ = mixer.disable(name);
            to_remove.push(track.id());
            continue;
        }

        if track.fill_status() == FillStatus::Filling
            && (ready >= cblk.frame_count() || cblk.take_force_ready())
        {
            track.set_fill_status(FillStatus::Filled);
        }

        if track.fill_status() == FillStatus::Filling || ready == 0 {
            let _ = mixer.disable(name);
            if ready == 0 && track.fill_status() != FillStatus::Filling {
                track.note_underrun();
                ThreadStatsAtomic::bump(&thread.stats.underruns);
            }
            if track.evictable() && track.count_retry() {
                warn!(
                    "playback thread {}: track {} starved, evicting",
                    thread.id,
                    track.id()
                );
                to_remove.push(track.id());
            }
            continue;
        }

        // Ready to mix.
        let instant = track.fill_status() == FillStatus::Filled;
        if instant {
            track.set_fill_status(FillStatus::Ready);
        }
        if state == TrackState::Resuming {
            track.set_state(TrackState::Active);
        }

        let factor = if track.is_muted() {
            0.0
        } else {
            thread.volumes.factor(track.stream_type())
        };
        let (cl, cr) = cblk.volume();
        let left = gain_from_float(factor * float_from_gain(cl));
        let right = gain_from_float(factor * float_from_gain(cr));
        let _ = mixer.set_volume(name, left, right, !instant);
        let _ = mixer.set_sample_rate(name, cblk.sample_rate());
        let _ = mixer.set_channel_count(name, track.channels());
        let _ = mixer.enable(name);
        track.reset_retries(MAX_TRACK_RETRIES);
        enabled += 1;
    }

    for id in to_remove {
        if let Some(pos) = active.iter().position(|t| t.id() == id) {
            let track = active.remove(pos);
            if track.state() == TrackState::Terminated {
                tracks.retain(|t| t.id() != id);
                let name = track.name();
                if name != NO_NAME {
                    let _ = mixer.set_buffer_provider(name, None);
                    let _ = mixer.release(name);
                    track.set_name(NO_NAME);
                }
            }
        }
    }

    if enabled > 0 {
        mixer.process(mix_buf);
        true
    } else {
        false
    }
}

/// Direct flavor: straight copy from the first active track into the
/// device buffer; hardware owns the volume.
fn prepare_direct(
    thread: &Arc<PlaybackThread>,
    st: &mut PlaybackState,
    frame_count: usize,
    mix_buf: &mut [i16],
) -> bool {
    let Some(track) = st.active.first().cloned() else {
        return false;
    };

    if track.state() == TrackState::Pausing {
        track.set_state(TrackState::Paused);
    }
    let state = track.state();
    let cblk = track.cblk();
    let ready = cblk.frames_ready();

    let drop_track = state == TrackState::Terminated
        || (state == TrackState::Stopped && ready == 0);
    if drop_track {
        st.active.retain(|t| t.id() != track.id());
        if state == TrackState::Terminated {
            st.tracks.retain(|t| t.id() != track.id());
        }
        return false;
    }
    if matches!(state, TrackState::Paused | TrackState::Pausing) {
        if track.count_retry() {
            st.active.retain(|t| t.id() != track.id());
        }
        return false;
    }

    if track.fill_status() == FillStatus::Filling
        && (ready >= cblk.frame_count() || cblk.take_force_ready())
    {
        track.set_fill_status(FillStatus::Filled);
    }
    if track.fill_status() == FillStatus::Filling || ready == 0 {
        if ready == 0 && track.fill_status() != FillStatus::Filling {
            track.note_underrun();
            ThreadStatsAtomic::bump(&thread.stats.underruns);
        }
        if track.evictable() && track.count_retry() {
            warn!(
                "playback thread {}: direct track {} starved, evicting",
                thread.id,
                track.id()
            );
            st.active.retain(|t| t.id() != track.id());
        }
        return false;
    }

    if track.fill_status() == FillStatus::Filled {
        track.set_fill_status(FillStatus::Ready);
    }
    if state == TrackState::Resuming {
        track.set_state(TrackState::Active);
    }

    let ch = thread.channels as usize;
    let mut done = 0usize;
    while done < frame_count {
        match track.get_next_buffer(frame_count - done) {
            Ok(chunk) => {
                let n = chunk.frames.min(frame_count - done);
                if n == 0 {
                    break;
                }
                mix_buf[done * ch..(done + n) * ch].copy_from_slice(&chunk.data[..n * ch]);
                track.release_buffer(n);
                done += n;
            }
            Err(_) => break,
        }
    }
    // Zero-fill short pulls.
    mix_buf[done * ch..frame_count * ch].fill(0);

    // Driver-side volume, normalized [0, 1]. The values stored are the
    // values applied, so a repeat with equal gains is a no-op.
    let factor = if track.is_muted() {
        0.0
    } else {
        thread.volumes.factor(track.stream_type())
    };
    let (cl, cr) = cblk.volume();
    let left = (factor * float_from_gain(cl)).clamp(0.0, 1.0);
    let right = (factor * float_from_gain(cr)).clamp(0.0, 1.0);
    if (left, right) != st.direct_applied_volume {
        st.direct_applied_volume = (left, right);
        st.direct_pending_volume = Some((left, right));
    }

    track.reset_retries(MAX_TRACK_RETRIES);
    true
}

fn apply_parameters(
    thread: &Arc<PlaybackThread>,
    st: &mut PlaybackState,
    mut stream: Option<&mut (dyn OutputStream + '_)>,
    kv_pairs: &str,
    mix_buf: &mut Vec<i16>,
    frame_count: &mut usize,
) -> ServerResult<()> {
    let params = AudioParameters::parse(kv_pairs);
    if params.is_empty() {
        return Ok(());
    }

    if params.get(KEY_FRAME_COUNT).is_some() {
        if !st.tracks.is_empty() {
            return Err(ServerError::InvalidOperation(
                "cannot change frame_count while tracks are open".into(),
            ));
        }
        let requested = params.get_int(KEY_FRAME_COUNT).unwrap_or(-1);
        if requested != *frame_count as i64 {
            return Err(ServerError::InvalidArgument(
                "frame_count is fixed by the device period".into(),
            ));
        }
    }

    let stream_keys = [KEY_SAMPLING_RATE, KEY_FORMAT, KEY_CHANNELS, KEY_ROUTING];
    let forwards = params.keys().any(|k| stream_keys.contains(&k));
    if forwards {
        let Some(stream) = stream.as_deref_mut() else {
            return Err(ServerError::InvalidOperation(
                "duplicating endpoint has no device stream".into(),
            ));
        };
        stream.set_parameters(kv_pairs)?;

        // The backend may have renegotiated; pick up the new geometry
        // and rebuild the mix path if it moved.
        let new_rate = stream.sample_rate();
        let new_fc = stream.buffer_size() / stream.frame_size();
        let changed = new_rate != thread.sample_rate() || new_fc != *frame_count;
        if changed {
            thread.sample_rate.store(new_rate, Ordering::Relaxed);
            thread.frame_count.store(new_fc, Ordering::Relaxed);
            thread.latency_ms.store(stream.latency_ms(), Ordering::Relaxed);
            *frame_count = new_fc;
            mix_buf.clear();
            mix_buf.resize(new_fc * thread.channels as usize, 0);
            if st.mixer.is_some() {
                let mut mixer = AudioMixer::new(new_fc, new_rate);
                for track in &st.tracks {
                    match mixer.allocate_track_name() {
                        Some(name) => {
                            track.set_name(name);
                            let _ = mixer.set_buffer_provider(
                                name,
                                Some(track.clone() as Arc<dyn BufferProvider>),
                            );
                            let _ = mixer.set_channel_count(name, track.channels());
                            let _ = mixer.set_sample_rate(name, track.cblk().sample_rate());
                        }
                        None => track.set_name(NO_NAME),
                    }
                }
                st.mixer = Some(mixer);
            }
            st.pending_events.push_back(IoConfigEvent::OutputConfigChanged {
                handle: thread.id,
                descriptor: thread.descriptor(),
            });
        } else if params.get(KEY_ROUTING).is_some() {
            st.pending_events.push_back(IoConfigEvent::OutputConfigChanged {
                handle: thread.id,
                descriptor: thread.descriptor(),
            });
        }
    }
    Ok(())
}

fn update_peaks(thread: &Arc<PlaybackThread>, mix_buf: &[i16]) {
    let mut peak = [0.0f32; 2];
    if thread.channels == 1 {
        for &s in mix_buf {
            let v = (s as f32 / 32768.0).abs();
            peak[0] = peak[0].max(v);
        }
        peak[1] = peak[0];
    } else {
        for frame in mix_buf.chunks_exact(2) {
            peak[0] = peak[0].max((frame[0] as f32 / 32768.0).abs());
            peak[1] = peak[1].max((frame[1] as f32 / 32768.0).abs());
        }
    }
    thread.peak_bits[0].store(peak[0].to_bits(), Ordering::Relaxed);
    thread.peak_bits[1].store(peak[1].to_bits(), Ordering::Relaxed);
}

/// Virtual track driving one destination mixer from a duplicating
/// endpoint. Sized for roughly three source periods at the destination
/// rate; tolerates downstream backpressure with a bounded overflow
/// queue.
pub(crate) struct OutputTrack {
    track: Arc<Track>,
    dest: Arc<PlaybackThread>,
    queue: Mutex<VecDeque<Vec<i16>>>,
    started: AtomicBool,
    /// Bounded wait for ring space when nothing is queued; one source
    /// period, so a healthy destination paces the duplicating loop at
    /// real time and a stalled one cannot hold it longer than a block.
    wait_time: Duration,
}

impl OutputTrack {
    pub fn new(
        dest: Arc<PlaybackThread>,
        source_rate: u32,
        source_frame_count: usize,
    ) -> ServerResult<Arc<Self>> {
        let dest_rate = dest.sample_rate();
        let frame_count =
            (3 * source_frame_count as u64 * dest_rate as u64 / source_rate as u64) as usize;
        let config = TrackConfig {
            stream_type: StreamType::Music,
            sample_rate: source_rate,
            format: SampleFormat::Pcm16,
            channels: 2,
            frame_count,
            static_buffer: false,
        };
        let track = dest.create_track_inner(None, &config, true)?;
        Ok(Arc::new(Self {
            track,
            dest,
            queue: Mutex::new(VecDeque::new()),
            started: AtomicBool::new(false),
            wait_time: Duration::from_secs_f64(source_frame_count as f64 / source_rate as f64),
        }))
    }

    pub fn dest_id(&self) -> IoHandle {
        self.dest.id()
    }

    /// Push one source block toward the destination. A zero-frame write
    /// only drains queued overflow. Returns false when overflow had to
    /// be dropped.
    pub fn write(&self, data: &[i16], frames: usize) -> bool {
        let cblk = self.track.cblk();

        if frames > 0 && !self.started.load(Ordering::Relaxed) {
            // Prime with silence up to one destination period so the
            // downstream mixer does not underrun on its first pull.
            let pad = self.dest.frame_count().saturating_sub(frames);
            if pad > 0 {
                let silence = vec![0i16; pad * 2];
                let _ = cblk.write(&silence, false);
            }
            if self.dest.start_track(&self.track).is_ok() {
                self.started.store(true, Ordering::Relaxed);
            }
        }

        let mut queue = self.queue.lock();
        while let Some(front) = queue.front_mut() {
            let written = cblk.write(front, false).unwrap_or(0);
            if written * 2 >= front.len() {
                queue.pop_front();
            } else {
                if written > 0 {
                    front.drain(..written * 2);
                }
                break;
            }
        }

        if frames == 0 {
            return true;
        }

        let mut remaining: &[i16] = &data[..frames * 2];
        if queue.is_empty() {
            // Nothing backlogged: give the destination one source period
            // to make room before spilling into the overflow queue.
            let deadline = Instant::now() + self.wait_time;
            loop {
                let written = cblk.write(remaining, false).unwrap_or(0);
                remaining = &remaining[written * 2..];
                if remaining.is_empty() || Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        if remaining.is_empty() {
            return true;
        }
        if queue.len() >= MAX_OVERFLOW_BUFFERS {
            warn!(
                "output track {}: destination {} stalled, dropping {} frames",
                self.track.id(),
                self.dest.id(),
                remaining.len() / 2
            );
            return false;
        }
        queue.push_back(remaining.to_vec());
        true
    }

    pub fn stop(&self) {
        if self.started.swap(false, Ordering::Relaxed) {
            self.dest.stop_track(&self.track);
        }
    }

    pub fn destroy(&self) {
        self.dest.destroy_track(&self.track);
    }
}
