//! Clock abstraction (C2)
//!
//! Every window/ban/throttle computation in this crate works in whole
//! epoch seconds. Production code reads the wall clock; tests inject a
//! `FixedClock` so window-boundary behavior (S1/S2/S5/S6 in spec.md §8)
//! can be exercised without sleeping in real time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic-enough wall clock at second resolution.
pub trait Clock: Send + Sync {
    /// Current time as epoch seconds.
    fn now_unix(&self) -> i64;
}

/// Reads `SystemTime::now()`. Used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_secs() as i64
    }
}

/// A clock that can be advanced deterministically in tests.
#[derive(Debug)]
pub struct FixedClock {
    now: AtomicI64,
}

impl FixedClock {
    pub fn new(start: i64) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    /// Advances the clock by `secs` seconds and returns the new value.
    pub fn advance(&self, secs: i64) -> i64 {
        self.now.fetch_add(secs, Ordering::SeqCst) + secs
    }

    pub fn set(&self, value: i64) {
        self.now.store(value, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now_unix(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
