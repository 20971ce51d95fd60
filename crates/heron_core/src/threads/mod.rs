//! Endpoint Threads
//!
//! Every endpoint owns exactly one dedicated thread: playback endpoints
//! run one of the three playback flavors (mixing, direct pass-through,
//! duplicating fan-out), input endpoints run the record loop. The
//! modules here share one locking discipline: server lock above thread
//! lock above control-block mutex above the hardware, never reversed,
//! and nothing dispatches observer callbacks while a thread lock is
//! held.

mod playback;
mod record;

pub(crate) use playback::{PlaybackKind, PlaybackThread};
pub(crate) use record::RecordThread;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::ThreadStats;

/// Lock-free counters every endpoint thread maintains.
#[derive(Default)]
pub(crate) struct ThreadStatsAtomic {
    pub writes: AtomicU64,
    pub frames_written: AtomicU64,
    pub delayed_writes: AtomicU64,
    pub standbys: AtomicU64,
    pub underruns: AtomicU64,
    pub overflow_drops: AtomicU64,
}

impl ThreadStatsAtomic {
    pub fn snapshot(&self) -> ThreadStats {
        ThreadStats {
            writes: self.writes.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            delayed_writes: self.delayed_writes.load(Ordering::Relaxed),
            standbys: self.standbys.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            overflow_drops: self.overflow_drops.load(Ordering::Relaxed),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}
