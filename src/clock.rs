//! Clock abstraction for the rate limit algorithms.
//!
//! All counter arithmetic is expressed in unix milliseconds supplied by a
//! [`Clock`]. Production code uses [`SystemClock`]; tests freeze and advance
//! time with [`FrozenClock`] so the algorithm tables are fully deterministic.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Thread-safe wall-clock time source in unix milliseconds.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current unix time in milliseconds.
    fn now_ms(&self) -> i64;
}

/// Wall clock backed by [`SystemTime`].
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying instant, so a frozen clock handed to a
/// daemon and kept by the test observe identical time.
#[derive(Debug, Clone)]
pub struct FrozenClock {
    now: Arc<AtomicI64>,
}

impl FrozenClock {
    /// Create a frozen clock pinned at the given unix millisecond.
    #[must_use]
    pub fn at(now_ms: i64) -> Self {
        Self {
            now: Arc::new(AtomicI64::new(now_ms)),
        }
    }

    /// Create a frozen clock pinned at the current system time.
    #[must_use]
    pub fn now() -> Self {
        Self::at(SystemClock.now_ms())
    }

    /// Advance the clock by `delta_ms` milliseconds.
    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }

    /// Pin the clock to an absolute unix millisecond.
    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }
}

impl Clock for FrozenClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
