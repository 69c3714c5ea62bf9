//! # Time Source Abstraction
//!
//! Every time-dependent subsystem (announce scheduling, route aging, transfer
//! expiry, the announce token bucket) reads time through the [`Clock`] trait
//! instead of calling into the OS directly. This keeps a single code path for
//! both deployment modes: cooperative single-threaded loops poll against the
//! same clock a multi-threaded host reads from its maintenance thread, and
//! tests substitute [`ManualClock`] for deterministic schedules.
//!
//! Time is expressed as milliseconds since the Unix epoch throughout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic-enough wall clock in epoch milliseconds.
///
/// Implementations must be cheap to call; the node reads the clock on every
/// inbound frame and every `poll()` tick.
pub trait Clock: Send + Sync {
    /// Current time as milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A manually-advanced clock for tests and simulation.
///
/// Shared via `Arc`; `advance()` moves time forward for every reader.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now_ms: AtomicU64::new(start_ms),
        }
    }

    /// Move time forward by `delta_ms`.
    pub fn advance(&self, delta_ms: u64) {
        self.now_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Jump to an absolute timestamp. Never moves time backwards.
    pub fn set(&self, now_ms: u64) {
        self.now_ms.fetch_max(now_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}
