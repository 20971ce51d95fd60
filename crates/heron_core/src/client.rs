//! Per-Process Client Records
//!
//! Each client process gets one `Client` holding its shared-memory
//! arena budget. Control blocks and PCM rings are accounted against it;
//! when the budget is exhausted, track creation fails with `NoMemory`.
//!
//! Lifetime: the server map holds clients weakly, every live track holds
//! its client strongly, so the record dies with its last track.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::{ServerError, ServerResult};
use crate::types::CLIENT_ARENA_BYTES;

pub struct Client {
    pid: u32,
    arena_bytes: usize,
    used: AtomicUsize,
}

impl Client {
    pub fn new(pid: u32) -> Arc<Self> {
        debug!("client record created for pid {}", pid);
        Arc::new(Self {
            pid,
            arena_bytes: CLIENT_ARENA_BYTES,
            used: AtomicUsize::new(0),
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn used_bytes(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    /// Reserve `bytes` from the arena.
    pub fn allocate(&self, bytes: usize) -> ServerResult<()> {
        let mut used = self.used.load(Ordering::Relaxed);
        loop {
            if used + bytes > self.arena_bytes {
                return Err(ServerError::NoMemory(format!(
                    "pid {}: {} + {} exceeds arena of {}",
                    self.pid, used, bytes, self.arena_bytes
                )));
            }
            match self.used.compare_exchange_weak(
                used,
                used + bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => used = actual,
            }
        }
    }

    pub fn free(&self, bytes: usize) {
        let _ = self
            .used
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |used| {
                Some(used.saturating_sub(bytes))
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_accounting() {
        let client = Client::new(100);
        client.allocate(1000).unwrap();
        assert_eq!(client.used_bytes(), 1000);
        client.free(400);
        assert_eq!(client.used_bytes(), 600);
    }

    #[test]
    fn test_arena_exhaustion() {
        let client = Client::new(100);
        client.allocate(CLIENT_ARENA_BYTES).unwrap();
        let err = client.allocate(1).unwrap_err();
        assert!(matches!(err, ServerError::NoMemory(_)));
    }
}
