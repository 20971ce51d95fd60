//! Record Endpoint Thread
//!
//! Symmetric to the playback loop with reversed roles: the thread reads
//! the device on its own cadence, optionally resamples and adapts
//! channels, and produces into the record track's ring; the client
//! consumes. At most one record track is active at a time, and start
//! and stop are synchronous: the caller blocks until the loop
//! acknowledges the transition.
//!
//! When resampling is needed the staging buffer read from the device is
//! exposed to the resampler through the provider contract; without it
//! the staging frames are copied (with pair-averaging or duplication)
//! straight into the ring.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use heron_hal::{InputStream, SampleFormat};
use heron_mix::{mono_to_stereo, stereo_to_mono, LinearResampler, SliceProvider};

use crate::cblk::ControlBlock;
use crate::client::Client;
use crate::error::{ServerError, ServerResult};
use crate::events::{EventDispatcher, IoConfigEvent};
use crate::param::{AudioParameters, KEY_CHANNELS, KEY_FRAME_COUNT, KEY_SAMPLING_RATE};
use crate::track::{RecordState, RecordTrack};
use crate::types::{EndpointDescriptor, IoHandle, RecordConfig};

use super::ThreadStatsAtomic;

/// Back-off after a device read error.
const READ_ERROR_SLEEP: Duration = Duration::from_secs(1);

/// Bound on the synchronous start/stop handshake.
const START_STOP_TIMEOUT: Duration = Duration::from_secs(3);

pub(crate) struct RecordThread {
    id: IoHandle,
    sample_rate: u32,
    channels: u16,
    format: SampleFormat,
    frame_count: usize,

    state: Mutex<RecordThreadState>,
    work_cv: Condvar,
    param_cv: Condvar,
    start_stop_cv: Condvar,
    exit_pending: AtomicBool,
    in_standby: AtomicBool,

    dispatcher: Arc<EventDispatcher>,
    pub(crate) stats: ThreadStatsAtomic,
    join: Mutex<Option<JoinHandle<()>>>,
}

struct RecordThreadState {
    track: Option<Arc<RecordTrack>>,
    param_requests: VecDeque<String>,
    param_result: Option<ServerResult<()>>,
    pending_events: VecDeque<IoConfigEvent>,
}

impl RecordThread {
    pub fn spawn(
        id: IoHandle,
        stream: Box<dyn InputStream>,
        dispatcher: Arc<EventDispatcher>,
    ) -> ServerResult<Arc<Self>> {
        let frame_count = stream.buffer_size() / stream.frame_size();
        let thread = Arc::new(Self {
            id,
            sample_rate: stream.sample_rate(),
            channels: stream.channels(),
            format: stream.format(),
            frame_count,
            state: Mutex::new(RecordThreadState {
                track: None,
                param_requests: VecDeque::new(),
                param_result: None,
                pending_events: VecDeque::new(),
            }),
            work_cv: Condvar::new(),
            param_cv: Condvar::new(),
            start_stop_cv: Condvar::new(),
            exit_pending: AtomicBool::new(false),
            in_standby: AtomicBool::new(true),
            dispatcher,
            stats: ThreadStatsAtomic::default(),
            join: Mutex::new(None),
        });
        thread.state.lock().pending_events.push_back(IoConfigEvent::InputOpened {
            handle: id,
            descriptor: thread.descriptor(),
        });
        let runner = Arc::clone(&thread);
        let handle = std::thread::Builder::new()
            .name(format!("heron-input-{}", id))
            .spawn(move || run_record(runner, stream))
            .map_err(|e| ServerError::InvalidOperation(format!("spawn failed: {e}")))?;
        *thread.join.lock() = Some(handle);
        Ok(thread)
    }

    pub fn id(&self) -> IoHandle {
        self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn is_standby(&self) -> bool {
        self.in_standby.load(Ordering::Relaxed)
    }

    pub fn descriptor(&self) -> EndpointDescriptor {
        EndpointDescriptor {
            sample_rate: self.sample_rate,
            channels: self.channels,
            format: self.format,
            frame_count: self.frame_count,
            latency_ms: (self.frame_count as u64 * 1000 / self.sample_rate as u64) as u32,
        }
    }

    /// Create the record track for this endpoint; one at a time.
    pub fn create_record_track(
        &self,
        client: Option<Arc<Client>>,
        config: &RecordConfig,
    ) -> ServerResult<Arc<RecordTrack>> {
        if config.channels == 0 || config.channels > 2 {
            return Err(ServerError::InvalidArgument(format!(
                "channel count {}",
                config.channels
            )));
        }
        if config.sample_rate == 0 {
            return Err(ServerError::InvalidArgument("zero sample rate".into()));
        }
        let mut st = self.state.lock();
        if st.track.is_some() {
            return Err(ServerError::InvalidOperation(
                "record track already open on this endpoint".into(),
            ));
        }
        let frame_count = if config.frame_count > 0 {
            config.frame_count
        } else {
            // Two device periods scaled to the requested rate.
            ((2 * self.frame_count as u64 * config.sample_rate as u64)
                / self.sample_rate as u64)
                .max(64) as usize
        };
        let cblk = ControlBlock::new(
            frame_count,
            config.channels,
            config.format,
            config.sample_rate,
            false,
            false,
        );
        if let Some(client) = &client {
            client.allocate(cblk.size_bytes())?;
        }
        let track = RecordTrack::new(
            config.sample_rate,
            config.channels,
            config.format,
            cblk,
            client,
        );
        st.track = Some(track.clone());
        debug!(
            "endpoint {}: created record track {} ({} Hz, {} ch)",
            self.id,
            track.id(),
            config.sample_rate,
            config.channels
        );
        Ok(track)
    }

    /// Synchronous start: returns once the loop runs the track.
    pub fn start_record(&self, track: &Arc<RecordTrack>) -> ServerResult<()> {
        let mut st = self.state.lock();
        let current = st
            .track
            .as_ref()
            .ok_or_else(|| ServerError::InvalidOperation("no record track".into()))?;
        if current.id() != track.id() {
            return Err(ServerError::InvalidOperation(
                "track does not belong to this endpoint".into(),
            ));
        }
        match track.state() {
            RecordState::Active => return Ok(()),
            RecordState::Idle | RecordState::Stopping => {
                track.cblk().reset();
                track.set_state(RecordState::Starting);
            }
            RecordState::Starting => {}
        }
        self.work_cv.notify_all();
        while track.state() != RecordState::Active {
            if self
                .start_stop_cv
                .wait_for(&mut st, START_STOP_TIMEOUT)
                .timed_out()
            {
                return Err(ServerError::WouldBlock);
            }
        }
        Ok(())
    }

    /// Synchronous stop: returns once the loop has quiesced the track.
    pub fn stop_record(&self, track: &Arc<RecordTrack>) -> ServerResult<()> {
        let mut st = self.state.lock();
        match track.state() {
            RecordState::Idle => return Ok(()),
            RecordState::Active | RecordState::Starting => {
                track.set_state(RecordState::Stopping);
            }
            RecordState::Stopping => {}
        }
        self.work_cv.notify_all();
        while track.state() != RecordState::Idle {
            if self
                .start_stop_cv
                .wait_for(&mut st, START_STOP_TIMEOUT)
                .timed_out()
            {
                return Err(ServerError::WouldBlock);
            }
        }
        Ok(())
    }

    /// Client handle dropped.
    pub fn destroy_record_track(&self, track: &Arc<RecordTrack>) {
        let _ = self.stop_record(track);
        let mut st = self.state.lock();
        if st
            .track
            .as_ref()
            .map(|t| t.id() == track.id())
            .unwrap_or(false)
        {
            st.track = None;
        }
        drop(st);
        self.work_cv.notify_all();
    }

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
                    reply.add(KEY_SAMPLING_RATE, self.sample_rate);
                }
                KEY_CHANNELS => {
                    reply.add(KEY_CHANNELS, self.channels);
                }
                KEY_FRAME_COUNT => {
                    reply.add(KEY_FRAME_COUNT, self.frame_count);
                }
                _ => {}
            }
        }
        reply.to_string()
    }

    pub fn exit(&self) {
        self.exit_pending.store(true, Ordering::Release);
        self.work_cv.notify_all();
        let handle = self.join.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

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

fn run_record(thread: Arc<RecordThread>, mut stream: Box<dyn InputStream>) {
    let device_ch = thread.channels as usize;
    let device_frames = thread.frame_count;
    let mut staging = vec![0i16; device_frames * device_ch];
    // Conversion state, rebuilt whenever a track goes active.
    let mut resampler: Option<LinearResampler> = None;
    let mut convert_buf: Vec<i16> = Vec::new();
    let mut out_buf: Vec<i16> = Vec::new();
    info!("record thread {} running", thread.id);

    loop {
        thread.dispatch_pending_events();

        let active_track: Arc<RecordTrack>;
        {
            let mut st = thread.state.lock();
            if thread.exit_pending.load(Ordering::Acquire) {
                break;
            }

            while let Some(kv) = st.param_requests.pop_front() {
                let has_track = st.track.is_some();
                let result = apply_parameters(&thread, has_track, &kv, stream.as_mut());
                st.param_result = Some(result);
                thread.param_cv.notify_all();
            }

            // Start/stop handshake: assign the new state and wake the
            // caller.
            if let Some(track) = st.track.clone() {
                match track.state() {
                    RecordState::Starting => {
                        let out_rate = track.sample_rate();
                        resampler = if out_rate != thread.sample_rate {
                            Some(LinearResampler::new(
                                thread.sample_rate,
                                out_rate,
                                thread.channels,
                            ))
                        } else {
                            None
                        };
                        // Worst-case frames one device period can become.
                        let max_out = (device_frames as u64 * out_rate as u64
                            / thread.sample_rate as u64) as usize
                            + 2;
                        convert_buf.resize(max_out * 2, 0);
                        out_buf.resize(max_out * track.channels() as usize, 0);
                        track.set_state(RecordState::Active);
                        thread.start_stop_cv.notify_all();
                        debug!("record thread {}: track {} active", thread.id, track.id());
                    }
                    RecordState::Stopping => {
                        track.set_state(RecordState::Idle);
                        thread.start_stop_cv.notify_all();
                        debug!("record thread {}: track {} stopped", thread.id, track.id());
                    }
                    _ => {}
                }
            }

            let running = st
                .track
                .as_ref()
                .map(|t| t.state() == RecordState::Active)
                .unwrap_or(false);
            if !running {
                if !thread.in_standby.swap(true, Ordering::Relaxed) {
                    ThreadStatsAtomic::bump(&thread.stats.standbys);
                }
                let _ = stream.standby();
                thread.work_cv.wait(&mut st);
                continue;
            }
            thread.in_standby.store(false, Ordering::Relaxed);
            active_track = st.track.clone().expect("checked above");
        }

        // Device read happens with no lock held.
        let staging_bytes = unsafe {
            // SAFETY: plain reinterpretation of the i16 staging buffer;
            // the device fills it with native-endian 16-bit PCM.
            std::slice::from_raw_parts_mut(
                staging.as_mut_ptr() as *mut u8,
                staging.len() * 2,
            )
        };
        let read = match stream.read(staging_bytes) {
            Ok(n) => n,
            Err(e) => {
                // No data is fabricated; drop the conversion phase and
                // let the device settle.
                warn!("record thread {} read failed: {}", thread.id, e);
                if let Some(r) = resampler.as_mut() {
                    r.reset();
                }
                std::thread::sleep(READ_ERROR_SLEEP);
                continue;
            }
        };
        let frames = read / (device_ch * 2);
        if frames == 0 {
            continue;
        }

        let track_ch = active_track.channels() as usize;
        let converted: &[i16] = match resampler.as_mut() {
            Some(resampler) => {
                // The staging buffer is the resampler's pull source.
                let provider = SliceProvider::new(&staging[..frames * device_ch], device_ch);
                let want = (frames as u64 * active_track.sample_rate() as u64
                    / thread.sample_rate as u64) as usize
                    + 1;
                let want = want.min(convert_buf.len() / 2);
                let produced = resampler.resample(&mut convert_buf, want, &provider);
                if track_ch == 1 {
                    let n = stereo_to_mono(&convert_buf[..produced * 2], &mut out_buf);
                    &out_buf[..n]
                } else {
                    &convert_buf[..produced * 2]
                }
            }
            None => {
                if track_ch == device_ch {
                    &staging[..frames * device_ch]
                } else if device_ch == 2 {
                    let n = stereo_to_mono(&staging[..frames * 2], &mut out_buf);
                    &out_buf[..n]
                } else {
                    let n = mono_to_stereo(&staging[..frames], &mut out_buf);
                    &out_buf[..n * 2]
                }
            }
        };

        let cblk = active_track.cblk();
        let want_frames = converted.len() / track_ch;
        let written = cblk.write(converted, false).unwrap_or(0);
        if written < want_frames {
            // Client is not draining: overrun, no blocking, no backlog.
            active_track.note_overrun();
            ThreadStatsAtomic::bump(&thread.stats.overflow_drops);
            warn!(
                "record thread {}: overrun, dropped {} frames",
                thread.id,
                want_frames - written
            );
        }
        ThreadStatsAtomic::bump(&thread.stats.writes);
        thread
            .stats
            .frames_written
            .fetch_add(written as u64, Ordering::Relaxed);
    }

    let _ = stream.standby();
    thread.dispatch_pending_events();
    thread
        .dispatcher
        .dispatch(&IoConfigEvent::InputClosed { handle: thread.id });
    info!("record thread {} exited", thread.id);
}

fn apply_parameters(
    thread: &Arc<RecordThread>,
    has_track: bool,
    kv_pairs: &str,
    stream: &mut dyn InputStream,
) -> ServerResult<()> {
    let params = AudioParameters::parse(kv_pairs);
    if params.is_empty() {
        return Ok(());
    }
    if params.get(KEY_FRAME_COUNT).is_some() {
        if has_track {
            return Err(ServerError::InvalidOperation(
                "cannot change frame_count while a record track is open".into(),
            ));
        }
        let requested = params.get_int(KEY_FRAME_COUNT).unwrap_or(-1);
        if requested != thread.frame_count as i64 {
            return Err(ServerError::InvalidArgument(
                "frame_count is fixed by the device period".into(),
            ));
        }
    }
    stream.set_parameters(kv_pairs)?;
    Ok(())
}
