//! Shared Control Block
//!
//! The lock-free single-producer/single-consumer ring shared between one
//! client and the server for a single track. For playback the client is
//! the producer and the endpoint thread the consumer; record reverses
//! the roles (`out == false`).
//!
//! Cursors are monotone `u64` frame counters. The physical buffer index
//! of a cursor is `cursor - base`; a base advances by the wrap amount
//! (normally `frame_count`, or `loop_end` for looping one-shot clips)
//! whenever its cursor reaches it, so `cursor - base` always stays in
//! `[0, frame_count]`.
//!
//! Fast path: the producer copies frames and releases `user` with a
//! store-release; the consumer acquires `user`, reads up to
//! `user - server` frames, and releases `server`. No locks.
//!
//! Slow path: a producer out of space parks on the block's condition
//! variable with a bounded timeout; the consumer signals it after every
//! cursor step. The consumer's step takes the mutex non-blockingly to
//! guard base bookkeeping against a wedged or malicious peer; on
//! contention it simply retries next cycle and the ring stays intact.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use heron_hal::SampleFormat;

use crate::error::{ServerError, ServerResult};
use crate::types::CBLK_WAIT_TIMEOUT;

pub struct ControlBlock {
    frame_count: usize,
    channels: u16,
    format: SampleFormat,
    /// Playback layout when true; record when false.
    out: bool,
    /// One-shot mode: the ring never recycles while playing, and an
    /// early `loop_end` retires-and-rearms frames instead.
    static_buffer: bool,

    sample_rate: AtomicU32,

    user: AtomicU64,
    user_base: AtomicU64,
    server: AtomicU64,
    server_base: AtomicU64,

    /// Early wrap point for the consumer, in frames from loop start
    /// (always 0). `frame_count` disables looping.
    loop_end: AtomicUsize,

    /// Client-suggested per-channel gain, Q4.12, `0x1000` unity.
    volume: [AtomicU32; 2],

    /// Set on creation/reset and on every underrun/overrun; cleared by
    /// the client side's first transfer. Gates spurious initial
    /// underruns.
    flow_control: AtomicBool,

    /// Client override of the fill-up gate.
    force_ready: AtomicBool,

    lock: Mutex<()>,
    cv: Condvar,

    buffer: UnsafeCell<Box<[i16]>>,
}

// SAFETY: the SPSC discipline makes buffer access disjoint: the producer
// only writes `[user - user_base, ...)` regions it owns before releasing
// `user`, and the consumer only reads regions below `user` it has not
// yet stepped past. Base bookkeeping is serialized by the mutex.
unsafe impl Send for ControlBlock {}
unsafe impl Sync for ControlBlock {}

impl ControlBlock {
    pub fn new(
        frame_count: usize,
        channels: u16,
        format: SampleFormat,
        sample_rate: u32,
        out: bool,
        static_buffer: bool,
    ) -> Arc<Self> {
        let samples = frame_count * channels as usize;
        Arc::new(Self {
            frame_count,
            channels,
            format,
            out,
            static_buffer,
            sample_rate: AtomicU32::new(sample_rate),
            user: AtomicU64::new(0),
            user_base: AtomicU64::new(0),
            server: AtomicU64::new(0),
            server_base: AtomicU64::new(0),
            loop_end: AtomicUsize::new(frame_count),
            volume: [
                AtomicU32::new(crate::UNITY_GAIN as u32),
                AtomicU32::new(crate::UNITY_GAIN as u32),
            ],
            flow_control: AtomicBool::new(true),
            force_ready: AtomicBool::new(false),
            lock: Mutex::new(()),
            cv: Condvar::new(),
            buffer: UnsafeCell::new(vec![0i16; samples].into_boxed_slice()),
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn is_output(&self) -> bool {
        self.out
    }

    pub fn is_static(&self) -> bool {
        self.static_buffer
    }

    /// Bytes per frame. 8-bit PCM is sized as 16-bit: clients up-convert
    /// before writing.
    pub fn frame_size(&self) -> usize {
        self.channels as usize * 2
    }

    /// Shared-memory footprint, for per-client arena accounting.
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.frame_count * self.frame_size()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate.load(Ordering::Relaxed)
    }

    pub fn set_sample_rate(&self, rate: u32) {
        self.sample_rate.store(rate, Ordering::Relaxed);
    }

    /// Frames the consumer may take right now.
    pub fn frames_ready(&self) -> usize {
        let user = self.user.load(Ordering::Acquire);
        let server = self.server.load(Ordering::Relaxed);
        (user - server) as usize
    }

    /// Frames the producer may fill right now.
    pub fn frames_available(&self) -> usize {
        self.frame_count - self.frames_ready()
    }

    /// Total frames the producer has ever written.
    pub fn frames_written(&self) -> u64 {
        self.user.load(Ordering::Relaxed)
    }

    pub fn set_volume(&self, left: i32, right: i32) {
        let max = crate::MAX_GAIN;
        self.volume[0].store(left.clamp(0, max) as u32, Ordering::Relaxed);
        self.volume[1].store(right.clamp(0, max) as u32, Ordering::Relaxed);
    }

    /// Per-channel Q4.12 gains as last set by the client.
    pub fn volume(&self) -> (i32, i32) {
        (
            self.volume[0].load(Ordering::Relaxed) as i32,
            self.volume[1].load(Ordering::Relaxed) as i32,
        )
    }

    pub fn flow_control(&self) -> bool {
        self.flow_control.load(Ordering::Acquire)
    }

    /// Flag an underrun (playback) or overrun (record).
    pub fn raise_flow_control(&self) {
        self.flow_control.store(true, Ordering::Release);
    }

    pub fn set_force_ready(&self) {
        self.force_ready.store(true, Ordering::Release);
    }

    /// Consume the force-ready override, if set.
    pub fn take_force_ready(&self) -> bool {
        self.force_ready.swap(false, Ordering::AcqRel)
    }

    /// Configure an early wrap point for looping one-shot playback.
    /// `end` is in frames; pass `frame_count` to disable.
    pub fn set_loop(&self, end: usize) -> ServerResult<()> {
        if end == 0 || end > self.frame_count {
            return Err(ServerError::InvalidArgument(format!(
                "loop end {} out of range (1..={})",
                end, self.frame_count
            )));
        }
        let _guard = self.lock.lock();
        self.loop_end.store(end, Ordering::Relaxed);
        Ok(())
    }

    /// The consumer's wrap point for the current pass.
    fn effective_end(&self) -> usize {
        self.loop_end.load(Ordering::Relaxed).min(self.frame_count)
    }

    /// Reset both cursors to their bases. Caller must have quiesced the
    /// peer (track stopped or paused); bookkeeping is done under the
    /// block mutex either way.
    pub fn reset(&self) {
        let _guard = self.lock.lock();
        self.user.store(0, Ordering::Release);
        self.user_base.store(0, Ordering::Relaxed);
        self.server.store(0, Ordering::Release);
        self.server_base.store(0, Ordering::Relaxed);
        self.loop_end.store(self.frame_count, Ordering::Relaxed);
        self.force_ready.store(false, Ordering::Relaxed);
        self.flow_control.store(true, Ordering::Release);
    }

    /// Producer: copy interleaved frames in, advancing `user`. With
    /// `blocking`, a full ring parks on the condition variable (bounded
    /// by `CBLK_WAIT_TIMEOUT`); otherwise returns the partial count.
    pub fn write(&self, data: &[i16], blocking: bool) -> ServerResult<usize> {
        let ch = self.channels as usize;
        let total = data.len() / ch;
        let mut written = 0;

        while written < total {
            let mut avail = self.frames_available();
            if avail == 0 {
                if !blocking {
                    break;
                }
                let mut guard = self.lock.lock();
                loop {
                    avail = self.frames_available();
                    if avail > 0 {
                        break;
                    }
                    let timed_out = self.cv.wait_for(&mut guard, CBLK_WAIT_TIMEOUT).timed_out();
                    // The peer signals without holding the mutex, so a
                    // timeout must re-check before giving up.
                    if timed_out && self.frames_available() == 0 {
                        drop(guard);
                        if written > 0 {
                            return Ok(written);
                        }
                        return Err(ServerError::WouldBlock);
                    }
                }
            }

            let user = self.user.load(Ordering::Relaxed);
            let base = self.user_base.load(Ordering::Relaxed);
            let offset = (user - base) as usize;
            let n = avail.min(self.frame_count - offset).min(total - written);

            // SAFETY: the region [offset, offset + n) is below the
            // consumer's reach (frames_available said so) and we are the
            // only producer.
            unsafe {
                let buf = &mut *self.buffer.get();
                buf[offset * ch..(offset + n) * ch]
                    .copy_from_slice(&data[written * ch..(written + n) * ch]);
            }
            self.release_write(n);
            written += n;
        }
        Ok(written)
    }

    fn release_write(&self, frames: usize) {
        let user = self.user.load(Ordering::Relaxed) + frames as u64;
        self.user.store(user, Ordering::Release);
        let base = self.user_base.load(Ordering::Relaxed);
        if (user - base) as usize >= self.frame_count {
            self.user_base
                .store(base + self.frame_count as u64, Ordering::Relaxed);
        }
        if self.out {
            // First client write retires the initial-underrun gate.
            self.flow_control.store(false, Ordering::Release);
        }
        self.cv.notify_all();
    }

    /// Consumer: borrow up to `max_frames` contiguous frames, or `None`
    /// when the ring is empty. The caller reports consumption through
    /// `step_consumer`.
    pub fn obtain_read(&self, max_frames: usize) -> Option<(&[i16], usize)> {
        let ready = self.frames_ready();
        if ready == 0 || max_frames == 0 {
            return None;
        }
        let server = self.server.load(Ordering::Relaxed);
        let base = self.server_base.load(Ordering::Relaxed);
        let offset = (server - base) as usize;
        let end = self.effective_end();
        if offset >= end {
            // Base bookkeeping lost a race with set_loop; skip a cycle.
            return None;
        }
        let n = ready.min(end - offset).min(max_frames);
        let ch = self.channels as usize;
        // SAFETY: [offset, offset + n) is at or below `user`, published
        // with release ordering, and we are the only consumer.
        let slice = unsafe { &(&*self.buffer.get())[offset * ch..(offset + n) * ch] };
        Some((slice, n))
    }

    /// Consumer: advance `server` past `frames` consumed frames.
    ///
    /// With `non_blocking` the base-bookkeeping mutex is only tried; a
    /// `WouldBlock` means nothing was advanced and the caller should
    /// retry next cycle.
    pub fn step_consumer(&self, frames: usize, non_blocking: bool) -> ServerResult<()> {
        let guard = if non_blocking {
            match self.lock.try_lock() {
                Some(g) => g,
                None => return Err(ServerError::WouldBlock),
            }
        } else {
            self.lock.lock()
        };

        let server = self.server.load(Ordering::Relaxed) + frames as u64;
        self.server.store(server, Ordering::Release);
        let base = self.server_base.load(Ordering::Relaxed);
        let end = self.effective_end();
        if (server - base) as usize >= end {
            self.server_base.store(base + end as u64, Ordering::Relaxed);
            if self.static_buffer && end < self.frame_count {
                // Looping one-shot: retire the pass and re-arm it so the
                // clip stays ready without a live producer.
                let user = self.user.load(Ordering::Relaxed);
                self.user.store(user + end as u64, Ordering::Release);
                let ubase = self.user_base.load(Ordering::Relaxed);
                self.user_base.store(ubase + end as u64, Ordering::Relaxed);
            }
        }
        if !self.out {
            // Record: the client's first read retires the overrun gate.
            self.flow_control.store(false, Ordering::Release);
        }
        drop(guard);
        self.cv.notify_all();
        Ok(())
    }

    /// Client-side read for record tracks: copy out up to `dst` frames.
    /// With `blocking`, waits (bounded) for at least one frame.
    pub fn read(&self, dst: &mut [i16], blocking: bool) -> ServerResult<usize> {
        let ch = self.channels as usize;
        let total = dst.len() / ch;
        let mut filled = 0;

        while filled < total {
            if self.frames_ready() == 0 {
                if !blocking || filled > 0 {
                    break;
                }
                let mut guard = self.lock.lock();
                loop {
                    if self.frames_ready() > 0 {
                        break;
                    }
                    let timed_out = self.cv.wait_for(&mut guard, CBLK_WAIT_TIMEOUT).timed_out();
                    if timed_out && self.frames_ready() == 0 {
                        return Err(ServerError::WouldBlock);
                    }
                }
            }
            let Some((src, n)) = self.obtain_read(total - filled) else {
                break;
            };
            dst[filled * ch..(filled + n) * ch].copy_from_slice(src);
            if let Err(e) = self.step_consumer(n, false) {
                warn!("record read failed to step: {}", e);
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Invariant check used by tests and debug assertions.
    pub fn invariants_hold(&self) -> bool {
        let user = self.user.load(Ordering::Acquire);
        let user_base = self.user_base.load(Ordering::Relaxed);
        let server = self.server.load(Ordering::Acquire);
        let server_base = self.server_base.load(Ordering::Relaxed);
        server <= user
            && (user - user_base) as usize <= self.frame_count
            && (server - server_base) as usize <= self.frame_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(frames: usize, channels: u16) -> Arc<ControlBlock> {
        ControlBlock::new(frames, channels, SampleFormat::Pcm16, 48000, true, false)
    }

    #[test]
    fn test_empty_and_full() {
        let cblk = block(8, 2);
        assert_eq!(cblk.frames_ready(), 0);
        assert_eq!(cblk.frames_available(), 8);

        let data = vec![1i16; 8 * 2];
        assert_eq!(cblk.write(&data, false).unwrap(), 8);
        assert_eq!(cblk.frames_ready(), 8);
        assert_eq!(cblk.frames_available(), 0);
        assert!(cblk.invariants_hold());

        // Full ring, non-blocking: zero frames accepted.
        assert_eq!(cblk.write(&data, false).unwrap(), 0);
    }

    #[test]
    fn test_wrap_around() {
        let cblk = block(4, 1);
        for round in 0..5 {
            let data = vec![round as i16; 4];
            assert_eq!(cblk.write(&data, false).unwrap(), 4);
            let (chunk, n) = cblk.obtain_read(4).unwrap();
            assert_eq!(n, 4);
            assert!(chunk.iter().all(|&s| s == round as i16));
            cblk.step_consumer(4, false).unwrap();
            assert!(cblk.invariants_hold());
        }
    }

    #[test]
    fn test_partial_reads_respect_order() {
        let cblk = block(8, 1);
        cblk.write(&[1, 2, 3, 4, 5, 6], false).unwrap();

        let (chunk, n) = cblk.obtain_read(3).unwrap();
        assert_eq!(&chunk[..n], &[1, 2, 3]);
        cblk.step_consumer(3, false).unwrap();

        let (chunk, n) = cblk.obtain_read(10).unwrap();
        assert_eq!(&chunk[..n], &[4, 5, 6]);
    }

    #[test]
    fn test_blocking_write_times_out() {
        let cblk = block(2, 1);
        cblk.write(&[1, 2], false).unwrap();
        let err = cblk.write(&[3], true).unwrap_err();
        assert!(matches!(err, ServerError::WouldBlock));
    }

    #[test]
    fn test_consumer_unblocks_producer() {
        let cblk = block(4, 1);
        cblk.write(&[0; 4], false).unwrap();

        let cblk2 = Arc::clone(&cblk);
        let producer = std::thread::spawn(move || cblk2.write(&[7; 2], true).unwrap());

        std::thread::sleep(std::time::Duration::from_millis(50));
        cblk.obtain_read(2).unwrap();
        cblk.step_consumer(2, false).unwrap();

        assert_eq!(producer.join().unwrap(), 2);
    }

    #[test]
    fn test_flow_control_gate() {
        let cblk = block(4, 1);
        // Raised at creation to suppress the initial underrun callback.
        assert!(cblk.flow_control());
        cblk.write(&[1], false).unwrap();
        assert!(!cblk.flow_control());
        cblk.raise_flow_control();
        assert!(cblk.flow_control());
    }

    #[test]
    fn test_reset_returns_cursors_to_bases() {
        let cblk = block(4, 1);
        cblk.write(&[1, 2, 3], false).unwrap();
        cblk.obtain_read(2).unwrap();
        cblk.step_consumer(2, false).unwrap();

        cblk.reset();
        assert_eq!(cblk.frames_ready(), 0);
        assert_eq!(cblk.frames_available(), 4);
        assert!(cblk.flow_control());
        assert!(cblk.invariants_hold());
    }

    #[test]
    fn test_step_consumer_respects_contention() {
        let cblk = block(4, 1);
        cblk.write(&[1, 2], false).unwrap();

        let guard = cblk.lock.lock();
        let err = cblk.step_consumer(1, true).unwrap_err();
        assert!(matches!(err, ServerError::WouldBlock));
        drop(guard);

        cblk.step_consumer(1, true).unwrap();
        assert_eq!(cblk.frames_ready(), 1);
    }

    #[test]
    fn test_static_loop_rearms() {
        let cblk = ControlBlock::new(8, 1, SampleFormat::Pcm16, 48000, true, true);
        cblk.write(&[10, 20, 30, 40, 0, 0, 0, 0], false).unwrap();
        cblk.set_loop(4).unwrap();

        for _ in 0..3 {
            let (chunk, n) = cblk.obtain_read(8).unwrap();
            assert_eq!(n, 4, "loop bounds each pass at loop_end");
            assert_eq!(&chunk[..2], &[10, 20]);
            cblk.step_consumer(n, false).unwrap();
            assert!(cblk.invariants_hold());
            assert!(cblk.frames_ready() >= 4, "loop re-arms the clip");
        }
    }

    #[test]
    fn test_record_layout_read() {
        let cblk = ControlBlock::new(8, 2, SampleFormat::Pcm16, 16000, false, false);
        // Server produces, client reads.
        cblk.write(&[5i16; 6 * 2], false).unwrap();
        let mut dst = vec![0i16; 4 * 2];
        assert_eq!(cblk.read(&mut dst, false).unwrap(), 4);
        assert!(dst.iter().all(|&s| s == 5));
        assert_eq!(cblk.frames_ready(), 2);
        // Client read retires the overrun gate on record blocks.
        assert!(!cblk.flow_control());
    }

    #[test]
    fn test_spsc_threads_preserve_order() {
        let cblk = block(16, 1);
        let writer_cblk = Arc::clone(&cblk);
        let writer = std::thread::spawn(move || {
            let mut next = 0i16;
            while next < 500 {
                let chunk: Vec<i16> = (next..(next + 10).min(500)).collect();
                let n = writer_cblk.write(&chunk, true).unwrap();
                next += n as i16;
            }
        });

        let mut expect = 0i16;
        while expect < 500 {
            if let Some((chunk, n)) = cblk.obtain_read(16) {
                for &s in &chunk[..n] {
                    assert_eq!(s, expect);
                    expect += 1;
                }
                cblk.step_consumer(n, false).unwrap();
            } else {
                std::thread::yield_now();
            }
            assert!(cblk.invariants_hold());
        }
        writer.join().unwrap();
    }
}
