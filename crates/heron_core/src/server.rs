//! Server Core
//!
//! Owns the endpoint registry, the per-pid client records, global volume
//! state, and the observer fan-out. Everything here runs on caller
//! threads; the real-time work lives in the endpoint threads.
//!
//! Locking: the server lock sits above every thread lock, which sits
//! above control-block mutexes and the hardware lock. Observer callbacks
//! are dispatched only after the server lock has been released.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info};

use heron_hal::{AudioHardware, AudioMode};

use crate::client::Client;
use crate::error::{ServerError, ServerResult};
use crate::events::{ConfigObserver, EventDispatcher, IoConfigEvent};
use crate::handle::{RecordHandle, TrackHandle};
use crate::threads::{PlaybackKind, PlaybackThread, RecordThread};
use crate::types::{
    EndpointDescriptor, InputConfig, IoHandle, OutputConfig, RecordConfig, StreamType,
    ThreadStats, TrackConfig, GLOBAL_IO_HANDLE,
};
use crate::volumes::StreamVolumes;

pub struct AudioServer {
    state: Mutex<ServerState>,
    hardware: Mutex<Box<dyn AudioHardware>>,
    dispatcher: Arc<EventDispatcher>,
    volumes: Arc<StreamVolumes>,
    silent_mode: Arc<AtomicBool>,
}

struct ServerState {
    playback: BTreeMap<IoHandle, Arc<PlaybackThread>>,
    record: BTreeMap<IoHandle, Arc<RecordThread>>,
    clients: HashMap<u32, Weak<Client>>,
    next_handle: IoHandle,
    mode: AudioMode,
}

impl AudioServer {
    pub fn new(hardware: Box<dyn AudioHardware>) -> ServerResult<Self> {
        hardware
            .init_check()
            .map_err(|_| ServerError::NotInitialized)?;
        info!("audio server starting");
        Ok(Self {
            state: Mutex::new(ServerState {
                playback: BTreeMap::new(),
                record: BTreeMap::new(),
                clients: HashMap::new(),
                next_handle: 1,
                mode: AudioMode::Normal,
            }),
            hardware: Mutex::new(hardware),
            dispatcher: EventDispatcher::new(),
            volumes: Arc::new(StreamVolumes::new()),
            silent_mode: Arc::new(AtomicBool::new(false)),
        })
    }

    // --- endpoint management ---

    /// Open a playback endpoint. Mixing flavor unless `config.direct`.
    pub fn open_output(&self, config: &OutputConfig) -> ServerResult<IoHandle> {
        let mut profile = config.profile;
        if !config.direct {
            // The mix pipeline always delivers stereo to the device;
            // mono sources are duplicated inside the mixer.
            if let Some(p) = profile.as_mut() {
                p.channels = 2;
            }
        }
        let mut st = self.state.lock();
        let stream = self
            .hardware
            .lock()
            .open_output_stream(config.devices, profile)?;
        let handle = st.next_handle;
        st.next_handle += 1;
        let kind = if config.direct {
            PlaybackKind::Direct
        } else {
            PlaybackKind::Mixer
        };
        let thread = PlaybackThread::spawn(
            handle,
            kind,
            stream,
            Arc::clone(&self.volumes),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.silent_mode),
        )?;
        st.playback.insert(handle, thread);
        debug!("opened output endpoint {} ({:?})", handle, kind);
        Ok(handle)
    }

    /// Open a duplicating endpoint fanning one mix out to `a` and `b`.
    pub fn open_duplicate_output(&self, a: IoHandle, b: IoHandle) -> ServerResult<IoHandle> {
        let (handle, thread, dest_a, dest_b) = {
            let mut st = self.state.lock();
            let dest_a = st.playback.get(&a).cloned().ok_or(ServerError::BadIndex(a))?;
            let dest_b = st.playback.get(&b).cloned().ok_or(ServerError::BadIndex(b))?;
            if dest_a.kind() == PlaybackKind::Duplicating
                || dest_b.kind() == PlaybackKind::Duplicating
            {
                return Err(ServerError::InvalidOperation(
                    "cannot duplicate into a duplicating endpoint".into(),
                ));
            }
            let handle = st.next_handle;
            st.next_handle += 1;
            let thread = PlaybackThread::spawn_duplicating(
                handle,
                dest_a.sample_rate(),
                dest_a.frame_count(),
                dest_a.latency_ms(),
                Arc::clone(&self.volumes),
                Arc::clone(&self.dispatcher),
                Arc::clone(&self.silent_mode),
            )?;
            st.playback.insert(handle, thread.clone());
            (handle, thread, dest_a, dest_b)
        };
        // Fan-out wiring takes destination thread locks; the server lock
        // is already released.
        thread.add_output_thread(&dest_a)?;
        thread.add_output_thread(&dest_b)?;
        debug!("opened duplicating endpoint {} -> ({}, {})", handle, a, b);
        Ok(handle)
    }

    pub fn open_input(&self, config: &InputConfig) -> ServerResult<IoHandle> {
        let mut st = self.state.lock();
        let stream = self
            .hardware
            .lock()
            .open_input_stream(config.devices, config.profile)?;
        let handle = st.next_handle;
        st.next_handle += 1;
        let thread = RecordThread::spawn(handle, stream, Arc::clone(&self.dispatcher))?;
        st.record.insert(handle, thread);
        debug!("opened input endpoint {}", handle);
        Ok(handle)
    }

    pub fn close_output(&self, handle: IoHandle) -> ServerResult<()> {
        let (thread, duplicators) = {
            let mut st = self.state.lock();
            let thread = st
                .playback
                .remove(&handle)
                .ok_or(ServerError::BadIndex(handle))?;
            let duplicators: Vec<Arc<PlaybackThread>> = st
                .playback
                .values()
                .filter(|t| t.kind() == PlaybackKind::Duplicating)
                .cloned()
                .collect();
            (thread, duplicators)
        };
        // Unwire any fan-out pointed at this endpoint first.
        for dup in duplicators {
            dup.remove_output_thread(handle);
        }
        thread.exit();
        debug!("closed output endpoint {}", handle);
        Ok(())
    }

    pub fn close_input(&self, handle: IoHandle) -> ServerResult<()> {
        let thread = self
            .state
            .lock()
            .record
            .remove(&handle)
            .ok_or(ServerError::BadIndex(handle))?;
        thread.exit();
        debug!("closed input endpoint {}", handle);
        Ok(())
    }

    pub fn suspend_output(&self, handle: IoHandle) -> ServerResult<()> {
        self.playback_thread(handle)?.suspend();
        Ok(())
    }

    pub fn restore_output(&self, handle: IoHandle) -> ServerResult<()> {
        self.playback_thread(handle)?.restore();
        Ok(())
    }

    pub fn output_handles(&self) -> Vec<IoHandle> {
        self.state.lock().playback.keys().copied().collect()
    }

    pub fn input_handles(&self) -> Vec<IoHandle> {
        self.state.lock().record.keys().copied().collect()
    }

    pub fn output_descriptor(&self, handle: IoHandle) -> ServerResult<EndpointDescriptor> {
        Ok(self.playback_thread(handle)?.descriptor())
    }

    pub fn output_stats(&self, handle: IoHandle) -> ServerResult<ThreadStats> {
        Ok(self.playback_thread(handle)?.stats())
    }

    /// Post-mix peak levels of a playback endpoint, normalized `[0, 1]`.
    pub fn output_peaks(&self, handle: IoHandle) -> ServerResult<(f32, f32)> {
        Ok(self.playback_thread(handle)?.peaks())
    }

    // --- track management ---

    /// Create a playback track for `pid` on `endpoint`.
    pub fn create_track(
        &self,
        pid: u32,
        endpoint: IoHandle,
        config: &TrackConfig,
    ) -> ServerResult<TrackHandle> {
        let mut st = self.state.lock();
        let thread = st
            .playback
            .get(&endpoint)
            .cloned()
            .ok_or(ServerError::BadIndex(endpoint))?;
        let client = Self::client_for(&mut st, pid);
        let track = thread.create_track(Some(client), config)?;
        Ok(TrackHandle::new(track, Arc::downgrade(&thread), endpoint))
    }

    /// Open a record track for `pid` on an input `endpoint`.
    pub fn open_record(
        &self,
        pid: u32,
        endpoint: IoHandle,
        config: &RecordConfig,
    ) -> ServerResult<RecordHandle> {
        let mut st = self.state.lock();
        let thread = st
            .record
            .get(&endpoint)
            .cloned()
            .ok_or(ServerError::BadIndex(endpoint))?;
        let client = Self::client_for(&mut st, pid);
        let track = thread.create_record_track(Some(client), config)?;
        Ok(RecordHandle::new(track, Arc::downgrade(&thread), endpoint))
    }

    fn client_for(st: &mut ServerState, pid: u32) -> Arc<Client> {
        if let Some(existing) = st.clients.get(&pid).and_then(Weak::upgrade) {
            return existing;
        }
        let client = Client::new(pid);
        st.clients.insert(pid, Arc::downgrade(&client));
        client
    }

    /// Move every track of `stream` onto `endpoint`, preserving active
    /// status, and tell observers.
    pub fn set_stream_output(&self, stream: StreamType, endpoint: IoHandle) -> ServerResult<()> {
        {
            let st = self.state.lock();
            let dest = st
                .playback
                .get(&endpoint)
                .cloned()
                .ok_or(ServerError::BadIndex(endpoint))?;
            if dest.kind() != PlaybackKind::Mixer {
                return Err(ServerError::InvalidOperation(
                    "destination endpoint cannot mix".into(),
                ));
            }
            let sources: Vec<Arc<PlaybackThread>> = st
                .playback
                .iter()
                .filter(|(h, t)| **h != endpoint && t.kind() == PlaybackKind::Mixer)
                .map(|(_, t)| t.clone())
                .collect();
            for source in sources {
                let moved = source.take_tracks(stream);
                if !moved.is_empty() {
                    debug!(
                        "moving {} {:?} tracks from endpoint {} to {}",
                        moved.len(),
                        stream,
                        source.id(),
                        endpoint
                    );
                    dest.put_tracks(moved);
                }
            }
        }
        // Stream re-route is a stream event, nothing else: it must never
        // read as a close to observers.
        self.dispatcher.dispatch(&IoConfigEvent::StreamConfigChanged {
            handle: endpoint,
            stream,
        });
        Ok(())
    }

    // --- global controls ---

    pub fn set_master_volume(&self, volume: f32) -> ServerResult<()> {
        self.volumes.set_master_volume(volume);
        self.hardware.lock().set_master_volume(volume)?;
        Ok(())
    }

    pub fn master_volume(&self) -> f32 {
        self.volumes.master_volume()
    }

    pub fn set_master_mute(&self, muted: bool) {
        self.volumes.set_master_mute(muted);
    }

    pub fn master_muted(&self) -> bool {
        self.volumes.master_muted()
    }

    pub fn set_stream_volume(&self, stream: StreamType, volume: f32) {
        self.volumes.set_stream_volume(stream, volume);
    }

    pub fn stream_volume(&self, stream: StreamType) -> f32 {
        self.volumes.stream_volume(stream)
    }

    pub fn set_stream_mute(&self, stream: StreamType, muted: bool) {
        self.volumes.set_stream_mute(stream, muted);
    }

    pub fn set_mode(&self, mode: AudioMode) -> ServerResult<()> {
        self.hardware.lock().set_mode(mode)?;
        self.state.lock().mode = mode;
        Ok(())
    }

    pub fn mode(&self) -> AudioMode {
        self.state.lock().mode
    }

    pub fn set_mic_mute(&self, muted: bool) -> ServerResult<()> {
        self.hardware.lock().set_mic_mute(muted)?;
        Ok(())
    }

    pub fn mic_mute(&self) -> bool {
        self.hardware.lock().mic_mute()
    }

    pub fn set_voice_volume(&self, volume: f32) -> ServerResult<()> {
        self.hardware.lock().set_voice_volume(volume)?;
        Ok(())
    }

    /// One-shot boot policy: when asserted, the next wake out of standby
    /// forces master mute.
    pub fn set_silent_mode(&self, silent: bool) {
        self.silent_mode.store(silent, Ordering::Relaxed);
    }

    /// `endpoint == GLOBAL_IO_HANDLE` targets the device itself.
    pub fn set_parameters(&self, endpoint: IoHandle, kv_pairs: &str) -> ServerResult<()> {
        if endpoint == GLOBAL_IO_HANDLE {
            self.hardware.lock().set_parameters(kv_pairs)?;
            return Ok(());
        }
        // The handshake can wait on the loop; do it without the server
        // lock.
        if let Ok(thread) = self.playback_thread(endpoint) {
            return thread.set_parameters(kv_pairs);
        }
        self.record_thread(endpoint)?.set_parameters(kv_pairs)
    }

    pub fn get_parameters(&self, endpoint: IoHandle, keys: &str) -> ServerResult<String> {
        if endpoint == GLOBAL_IO_HANDLE {
            return Ok(self.hardware.lock().get_parameters(keys));
        }
        if let Ok(thread) = self.playback_thread(endpoint) {
            return Ok(thread.get_parameters(keys));
        }
        Ok(self.record_thread(endpoint)?.get_parameters(keys))
    }

    /// Register an observer for endpoint open/close/config events.
    pub fn register_client(&self, observer: Arc<dyn ConfigObserver>) {
        self.dispatcher.register(observer);
    }

    fn playback_thread(&self, handle: IoHandle) -> ServerResult<Arc<PlaybackThread>> {
        self.state
            .lock()
            .playback
            .get(&handle)
            .cloned()
            .ok_or(ServerError::BadIndex(handle))
    }

    fn record_thread(&self, handle: IoHandle) -> ServerResult<Arc<RecordThread>> {
        self.state
            .lock()
            .record
            .get(&handle)
            .cloned()
            .ok_or(ServerError::BadIndex(handle))
    }
}

impl Drop for AudioServer {
    fn drop(&mut self) {
        let (playback, record) = {
            let mut st = self.state.lock();
            (
                std::mem::take(&mut st.playback),
                std::mem::take(&mut st.record),
            )
        };
        // Duplicating endpoints first: their fan-out holds tracks on the
        // device endpoints.
        for thread in playback
            .values()
            .filter(|t| t.kind() == PlaybackKind::Duplicating)
        {
            thread.exit();
        }
        for thread in playback
            .values()
            .filter(|t| t.kind() != PlaybackKind::Duplicating)
        {
            thread.exit();
        }
        for thread in record.values() {
            thread.exit();
        }
        info!("audio server stopped");
    }
}
