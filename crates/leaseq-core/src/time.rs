//! Clock abstraction for lease timestamps.
//!
//! Every lease decision compares timestamps produced by a [`Clock`]: the
//! claim time, each heartbeat, and the reclaim cutoff. Injecting the clock
//! keeps lease expiry deterministic under test, where [`TestClock`] only
//! moves when told to.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Clock abstraction for time operations.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Returns the current system time as a UTC timestamp.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }
}

/// Real clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Test clock for deterministic time control.
///
/// Clones share the same underlying time, so a clone handed to a worker
/// observes every `advance` made through the original.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// System time as nanoseconds since UNIX_EPOCH
    system_ns: Arc<AtomicU64>,
}

impl TestClock {
    /// Creates a new test clock starting at current time.
    pub fn new() -> Self {
        Self::with_start_time(SystemTime::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: SystemTime) -> Self {
        let since_epoch = start.duration_since(UNIX_EPOCH).unwrap_or_default();

        Self { system_ns: Arc::new(AtomicU64::new(saturating_nanos(since_epoch))) }
    }

    /// Advances the clock by the specified duration.
    pub fn advance(&self, duration: Duration) {
        self.system_ns.fetch_add(saturating_nanos(duration), Ordering::AcqRel);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now_system(&self) -> SystemTime {
        let ns = self.system_ns.load(Ordering::Acquire);
        UNIX_EPOCH + Duration::from_nanos(ns)
    }
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_system_time() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1000);
        let clock = TestClock::with_start_time(start);

        assert_eq!(clock.now_system(), start);

        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now_system(), start + Duration::from_secs(60));
    }

    #[test]
    fn utc_timestamp_tracks_system_time() {
        let start = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let clock = TestClock::with_start_time(start);

        assert_eq!(clock.now_utc().timestamp(), 1_700_000_000);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now_utc().timestamp_millis(), 1_700_000_001_500);
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let shared = clock.clone();

        clock.advance(Duration::from_secs(30));

        assert_eq!(shared.now_system(), clock.now_system());
    }
}
