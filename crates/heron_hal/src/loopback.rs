//! Loopback Backend
//!
//! An output stream and an input stream joined by an in-process byte
//! pipe: whatever a playback endpoint writes can be read back by a
//! record endpoint (or a test). Backpressure is real: the writer blocks
//! when the pipe is full, so the consumer paces the producer exactly
//! like hardware would.
//!
//! No format conversion happens in the pipe; it carries raw bytes. Open
//! both ends with the profiles you mean to test.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{HalError, HalResult};
use crate::traits::{
    AudioHardware, AudioMode, InputStream, OutputStream, SampleFormat, StreamProfile,
};

const DEFAULT_PERIOD_FRAMES: usize = 1024;

/// How long a full-pipe writer waits before giving up.
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long an empty-pipe reader waits before padding with silence.
const READ_TIMEOUT: Duration = Duration::from_millis(250);

/// The shared byte pipe.
pub struct LoopbackPipe {
    data: Mutex<VecDeque<u8>>,
    readable: Condvar,
    writable: Condvar,
    capacity: usize,
}

impl LoopbackPipe {
    fn new(capacity: usize) -> Self {
        Self {
            data: Mutex::new(VecDeque::with_capacity(capacity)),
            readable: Condvar::new(),
            writable: Condvar::new(),
            capacity,
        }
    }

    /// Bytes currently buffered. Test hook.
    pub fn buffered(&self) -> usize {
        self.data.lock().len()
    }

    /// Drop everything buffered. Test hook.
    pub fn clear(&self) {
        self.data.lock().clear();
        self.writable.notify_all();
    }
}

pub struct LoopbackHardware {
    pipe: Arc<LoopbackPipe>,
    period_frames: usize,
    mic_muted: bool,
    mode: AudioMode,
}

impl LoopbackHardware {
    pub fn new() -> Self {
        Self::with_period(DEFAULT_PERIOD_FRAMES)
    }

    pub fn with_period(period_frames: usize) -> Self {
        // Room for about one second of stereo 16-bit at 48 kHz.
        let capacity = 48000 * 4;
        Self {
            pipe: Arc::new(LoopbackPipe::new(capacity)),
            period_frames,
            mic_muted: false,
            mode: AudioMode::Normal,
        }
    }

    /// Direct access to the pipe, for tests that inspect the stream.
    pub fn pipe(&self) -> Arc<LoopbackPipe> {
        Arc::clone(&self.pipe)
    }
}

impl Default for LoopbackHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioHardware for LoopbackHardware {
    fn init_check(&self) -> HalResult<()> {
        Ok(())
    }

    fn set_mode(&mut self, mode: AudioMode) -> HalResult<()> {
        self.mode = mode;
        Ok(())
    }

    fn set_master_volume(&mut self, _volume: f32) -> HalResult<()> {
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
        let profile = profile.unwrap_or_default();
        profile.validate().map_err(HalError::UnsupportedProfile)?;
        Ok(Box::new(LoopbackOutput {
            pipe: Arc::clone(&self.pipe),
            profile,
            period_frames: self.period_frames,
        }))
    }

    fn open_input_stream(
        &mut self,
        _devices: u32,
        profile: Option<StreamProfile>,
    ) -> HalResult<Box<dyn InputStream>> {
        let profile = profile.unwrap_or_default();
        profile.validate().map_err(HalError::UnsupportedProfile)?;
        Ok(Box::new(LoopbackInput {
            pipe: Arc::clone(&self.pipe),
            profile,
            period_frames: self.period_frames,
        }))
    }
}

struct LoopbackOutput {
    pipe: Arc<LoopbackPipe>,
    profile: StreamProfile,
    period_frames: usize,
}

impl OutputStream for LoopbackOutput {
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
        (self.period_frames as u64 * 2000 / self.profile.sample_rate as u64) as u32
    }

    fn write(&mut self, buf: &[u8]) -> HalResult<usize> {
        let mut data = self.pipe.data.lock();
        let mut written = 0;
        while written < buf.len() {
            if data.len() >= self.pipe.capacity {
                let timed_out = self
                    .pipe
                    .writable
                    .wait_for(&mut data, WRITE_TIMEOUT)
                    .timed_out();
                if timed_out {
                    warn!("loopback pipe full for {:?}, dropping write", WRITE_TIMEOUT);
                    return Err(HalError::WriteFailed("loopback pipe stalled".into()));
                }
                continue;
            }
            let room = self.pipe.capacity - data.len();
            let take = room.min(buf.len() - written);
            data.extend(&buf[written..written + take]);
            written += take;
            self.pipe.readable.notify_all();
        }
        Ok(written)
    }

    fn standby(&mut self) -> HalResult<()> {
        Ok(())
    }

    fn set_volume(&mut self, _left: f32, _right: f32) -> HalResult<()> {
        Ok(())
    }

    fn set_parameters(&mut self, _kv_pairs: &str) -> HalResult<()> {
        Ok(())
    }

    fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }
}

struct LoopbackInput {
    pipe: Arc<LoopbackPipe>,
    profile: StreamProfile,
    period_frames: usize,
}

impl InputStream for LoopbackInput {
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

    fn read(&mut self, buf: &mut [u8]) -> HalResult<usize> {
        let mut data = self.pipe.data.lock();
        let mut filled = 0;
        while filled < buf.len() {
            if data.is_empty() {
                let timed_out = self
                    .pipe
                    .readable
                    .wait_for(&mut data, READ_TIMEOUT)
                    .timed_out();
                if timed_out {
                    // Nothing playing; pad with silence and keep cadence.
                    buf[filled..].fill(0);
                    filled = buf.len();
                    break;
                }
                continue;
            }
            while filled < buf.len() {
                match data.pop_front() {
                    Some(b) => {
                        buf[filled] = b;
                        filled += 1;
                    }
                    None => break,
                }
            }
            self.pipe.writable.notify_all();
        }
        Ok(filled)
    }

    fn standby(&mut self) -> HalResult<()> {
        Ok(())
    }

    fn set_gain(&mut self, _gain: f32) -> HalResult<()> {
        Ok(())
    }

    fn set_parameters(&mut self, _kv_pairs: &str) -> HalResult<()> {
        Ok(())
    }

    fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_round_trip() {
        let mut hw = LoopbackHardware::with_period(256);
        let mut out = hw.open_output_stream(0, None).unwrap();
        let mut input = hw.open_input_stream(0, None).unwrap();

        let payload: Vec<u8> = (0..=255).collect();
        out.write(&payload).unwrap();

        let mut back = vec![0u8; payload.len()];
        let n = input.read(&mut back).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(back, payload);
    }

    #[test]
    fn test_empty_pipe_reads_silence() {
        let mut hw = LoopbackHardware::with_period(64);
        let mut input = hw.open_input_stream(0, None).unwrap();
        let mut buf = vec![0xaau8; 128];
        let n = input.read(&mut buf).unwrap();
        assert_eq!(n, 128);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_reader_unblocks_full_writer() {
        let mut hw = LoopbackHardware::with_period(256);
        let pipe = hw.pipe();
        let mut out = hw.open_output_stream(0, None).unwrap();
        let mut input = hw.open_input_stream(0, None).unwrap();

        // Fill to capacity.
        let chunk = vec![1u8; pipe.capacity];
        out.write(&chunk).unwrap();
        assert_eq!(pipe.buffered(), pipe.capacity);

        // A concurrent reader must let this write finish.
        let reader = std::thread::spawn(move || {
            let mut buf = vec![0u8; 4096];
            input.read(&mut buf).unwrap();
        });
        out.write(&[2u8; 4096]).unwrap();
        reader.join().unwrap();
    }
}
