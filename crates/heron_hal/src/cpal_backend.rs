//! cpal Backend
//!
//! Real audio output through cpal, bridged from the blocking HAL write
//! contract to cpal's pull-model callback with an rtrb ring. The cpal
//! `Stream` is not `Send`, so it lives on a dedicated thread that parks
//! until the HAL stream is dropped.
//!
//! Capture is not provided by this backend; input endpoints keep using
//! the null or loopback sources.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::bounded;
use tracing::{debug, error, warn};

use crate::error::{HalError, HalResult};
use crate::traits::{
    AudioHardware, AudioMode, InputStream, OutputStream, SampleFormat, StreamProfile,
};

const RING_PERIODS: usize = 4;
const DEFAULT_PERIOD_FRAMES: usize = 1024;

pub struct CpalHardware {
    mic_muted: bool,
    mode: AudioMode,
    period_frames: usize,
}

impl CpalHardware {
    pub fn new() -> Self {
        Self {
            mic_muted: false,
            mode: AudioMode::Normal,
            period_frames: DEFAULT_PERIOD_FRAMES,
        }
    }
}

impl Default for CpalHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHardware for CpalHardware {
    fn init_check(&self) -> HalResult<()> {
        cpal::default_host()
            .default_output_device()
            .map(|_| ())
            .ok_or_else(|| HalError::DeviceNotFound("default output".into()))
    }

    fn set_mode(&mut self, mode: AudioMode) -> HalResult<()> {
        self.mode = mode;
        Ok(())
    }

    fn set_master_volume(&mut self, _volume: f32) -> HalResult<()> {
        // No hardware master control; the software mixer owns volume.
        Ok(())
    }

    fn set_voice_volume(&mut self, _volume: f32) -> HalResult<()> {
        Ok(())
    }

    fn set_mic_mute(&mut self, muted: bool) -> HalResult<()> {
        self.mic_muted = muted;
        Ok(())
    }

    fn mic_mute(&self) -> bool {
        self.mic_muted
    }

    fn set_parameters(&mut self, _kv_pairs: &str) -> HalResult<()> {
        Ok(())
    }

    fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }

    fn input_buffer_size(&self, profile: &StreamProfile) -> usize {
        self.period_frames * profile.frame_size()
    }

    fn open_output_stream(
        &mut self,
        _devices: u32,
        profile: Option<StreamProfile>,
    ) -> HalResult<Box<dyn OutputStream>> {
        let profile = profile.unwrap_or(StreamProfile {
            sample_rate: 48000,
            channels: 2,
            format: SampleFormat::Pcm16,
        });
        profile.validate().map_err(HalError::UnsupportedProfile)?;
        Ok(Box::new(CpalOutputStream::open(
            profile,
            self.period_frames,
        )?))
    }

    fn open_input_stream(
        &mut self,
        _devices: u32,
        _profile: Option<StreamProfile>,
    ) -> HalResult<Box<dyn InputStream>> {
        Err(HalError::StreamBuildError(
            "cpal backend is output-only".into(),
        ))
    }
}

pub struct CpalOutputStream {
    profile: StreamProfile,
    period_frames: usize,
    producer: rtrb::Producer<i16>,
    shutdown: Arc<AtomicBool>,
    stream_thread: Option<JoinHandle<()>>,
    volume: (f32, f32),
}

impl CpalOutputStream {
    fn open(profile: StreamProfile, period_frames: usize) -> HalResult<Self> {
        let ring_len = period_frames * profile.channels as usize * RING_PERIODS;
        let (producer, mut consumer) = rtrb::RingBuffer::<i16>::new(ring_len);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_for_thread = Arc::clone(&shutdown);
        // The stream must be created *and held* on its own thread; report
        // success or failure back through a rendezvous channel.
        let (ready_tx, ready_rx) = bounded::<Result<(), String>>(1);

        let channels = profile.channels;
        let sample_rate = profile.sample_rate;
        let stream_thread = std::thread::Builder::new()
            .name("heron-cpal-output".into())
            .spawn(move || {
                let device = match cpal::default_host().default_output_device() {
                    Some(d) => d,
                    None => {
                        let _ = ready_tx.send(Err("no default output device".into()));
                        return;
                    }
                };
                let config = cpal::StreamConfig {
                    channels,
                    sample_rate: cpal::SampleRate(sample_rate),
                    buffer_size: cpal::BufferSize::Default,
                };
                let stream = device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        // Real-time callback: drain the ring, zero-fill on
                        // underrun.
                        for sample in data.iter_mut() {
                            *sample = match consumer.pop() {
                                Ok(s) => s as f32 / 32768.0,
                                Err(_) => 0.0,
                            };
                        }
                    },
                    move |err| {
                        error!("cpal output stream error: {}", err);
                    },
                    None,
                );
                let stream = match stream {
                    Ok(s) => s,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e.to_string()));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                debug!("cpal output stream running");
                while !shutdown_for_thread.load(Ordering::Relaxed) {
                    std::thread::sleep(Duration::from_millis(50));
                }
                drop(stream);
            })
            .map_err(|e| HalError::StreamBuildError(e.to_string()))?;

        match ready_rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Ok(())) => {}
            Ok(Err(msg)) => return Err(HalError::StreamBuildError(msg)),
            Err(_) => return Err(HalError::StreamBuildError("stream thread stalled".into())),
        }

        Ok(Self {
            profile,
            period_frames,
            producer,
            shutdown,
            stream_thread: Some(stream_thread),
            volume: (1.0, 1.0),
        })
    }
}

impl OutputStream for CpalOutputStream {
    fn sample_rate(&self) -> u32 {
        self.profile.sample_rate
    }

    fn channels(&self) -> u16 {
        self.profile.channels
    }

    fn format(&self) -> SampleFormat {
        self.profile.format
    }

    fn buffer_size(&self) -> usize {
        self.period_frames * self.profile.frame_size()
    }

    fn latency_ms(&self) -> u32 {
        (self.period_frames as u64 * RING_PERIODS as u64 * 1000
            / self.profile.sample_rate as u64) as u32
    }

    fn write(&mut self, buf: &[u8]) -> HalResult<usize> {
        // Blocking contract: the callback drains the ring at device rate,
        // so waiting for slots paces the caller.
        for bytes in buf.chunks_exact(2) {
            let sample = i16::from_le_bytes([bytes[0], bytes[1]]);
            loop {
                match self.producer.push(sample) {
                    Ok(()) => break,
                    Err(_) => {
                        if self.shutdown.load(Ordering::Relaxed) {
                            return Err(HalError::WriteFailed("stream shut down".into()));
                        }
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
            }
        }
        Ok(buf.len())
    }

    fn standby(&mut self) -> HalResult<()> {
        // The callback keeps running and zero-fills; nothing to do.
        Ok(())
    }

    fn set_volume(&mut self, left: f32, right: f32) -> HalResult<()> {
        self.volume = (left.clamp(0.0, 1.0), right.clamp(0.0, 1.0));
        warn!("cpal backend has no hardware volume; value recorded only");
        Ok(())
    }

    fn set_parameters(&mut self, _kv_pairs: &str) -> HalResult<()> {
        Ok(())
    }

    fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }
}

impl Drop for CpalOutputStream {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.stream_thread.take() {
            let _ = handle.join();
        }
    }
}
