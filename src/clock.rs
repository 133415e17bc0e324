//! Wall-clock abstraction.
//!
//! Retry scheduling compares persisted `next_retry_at_ms` timestamps against
//! "now", so tests need to control time without sleeping through real
//! backoff windows. The delivery loop, gate, and producer all read time
//! through [`Clock`]; production wiring uses [`SystemClock`], tests use
//! [`ManualClock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of Unix-millisecond timestamps.
pub trait Clock: Send + Sync {
    /// Current time as Unix milliseconds.
    fn now_ms(&self) -> u64;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// A hand-advanced clock for tests.
///
/// Starts at an arbitrary epoch and only moves when told to, which makes
/// backoff windows deterministic: schedule a retry, assert nothing happens,
/// advance past `next_retry_at_ms`, assert the retry runs.
#[derive(Debug)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    /// Creates a manual clock starting at `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Moves the clock forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Sets the clock to an absolute time.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
