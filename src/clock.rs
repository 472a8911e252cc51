//! Time sources for unavailability windows.
//!
//! Back-off windows are evaluated against [`TimeProvider::now`] on every check,
//! so tests can swap in a [`MockTimeProvider`] and move time by hand.

use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub trait TimeProvider: Send + Sync {
    fn now(&self) -> Instant;
}

/// Reads the real monotonic clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually driven clock for tests.
#[derive(Debug, Clone)]
pub struct MockTimeProvider {
    current: Arc<RwLock<Instant>>,
}

impl MockTimeProvider {
    pub fn new(start: Instant) -> Self {
        Self {
            current: Arc::new(RwLock::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.current.write() += by;
    }
}

impl Default for MockTimeProvider {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl TimeProvider for MockTimeProvider {
    fn now(&self) -> Instant {
        *self.current.read()
    }
}
