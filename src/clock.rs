//! Wall-clock sources.
//!
//! Breaker timeouts and rate-limit windows are expressed in wall-clock time
//! (epoch milliseconds) so that windows line up across processes. Tests use
//! [`MockClock`] to move time forward without sleeping.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of the current time.
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;

    /// Seconds since the Unix epoch.
    fn now_secs(&self) -> u64 {
        self.now_millis() / 1000
    }
}

/// System clock backed by `SystemTime::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// Manually driven clock.
///
/// Clones share the same time value, so a test can hand one clone to the
/// component under test and advance another.
///
/// ```
/// use bulwark::clock::{Clock, MockClock};
/// use std::time::Duration;
///
/// let clock = MockClock::new(1_000);
/// clock.advance(Duration::from_secs(2));
/// assert_eq!(clock.now_millis(), 3_000);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    current_millis: Arc<AtomicU64>,
}

impl MockClock {
    /// Create a mock clock starting at `start_millis` since the epoch.
    pub fn new(start_millis: u64) -> Self {
        Self {
            current_millis: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.current_millis
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.current_millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_millis(&self) -> u64 {
        self.current_millis.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_after_2020() {
        let clock = SystemClock::new();
        assert!(clock.now_secs() > 1_577_836_800);
    }

    #[test]
    fn test_mock_clock_shared_between_clones() {
        let clock = MockClock::new(10_000);
        let other = clock.clone();

        other.advance(Duration::from_millis(1_500));
        assert_eq!(clock.now_millis(), 11_500);
        assert_eq!(clock.now_secs(), 11);

        clock.set(60_000);
        assert_eq!(other.now_secs(), 60);
    }
}
