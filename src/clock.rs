//! Clock Abstraction
//!
//! All wall-clock reads in the buffering engine go through [`Clock`], so the
//! flush triggers can be driven by virtual time in tests and by system time
//! in production.
//!
//! Timestamps are Unix epoch milliseconds, the same unit the persisted actor
//! fields use.

use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Unix epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    pub fn saturating_sub(&self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(other.0))
    }

    /// ISO-8601 with millisecond precision in UTC, e.g. `2024-03-01T12:00:00.000Z`
    pub fn to_iso8601(&self) -> String {
        self.to_datetime()
            .to_rfc3339_opts(SecondsFormat::Millis, true)
    }

    pub fn to_datetime(&self) -> DateTime<Utc> {
        // i64::MAX ms is far beyond chrono's range; clamp rather than fail.
        let ms = i64::try_from(self.0).unwrap_or(i64::MAX);
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl std::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_iso8601())
    }
}

/// Clock trait for time operations
///
/// Implementations:
/// - `SystemClock`: real wall-clock time
/// - `SimulatedClock`: controlled virtual time for tests and DST
pub trait Clock: Send + Sync + Clone + 'static {
    /// Get current time
    fn now(&self) -> Timestamp;

    /// Get elapsed time since a previous timestamp
    fn elapsed(&self, since: Timestamp) -> Duration {
        self.now().saturating_sub(since)
    }
}

/// Production clock using real system time
///
/// Anchored once at construction and advanced with a monotonic `Instant`, so
/// wall-clock adjustments never move flush deadlines backwards.
#[derive(Clone)]
pub struct SystemClock {
    start: Instant,
    start_millis: u64,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemClock {
    pub fn new() -> Self {
        let start_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        SystemClock {
            start: Instant::now(),
            start_millis,
        }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.start.elapsed().as_millis() as u64;
        Timestamp(self.start_millis.saturating_add(elapsed))
    }
}

/// Simulated clock for deterministic testing
///
/// Time only advances when explicitly told to via `advance()` or `set()`.
/// Clones share the same underlying time.
#[derive(Clone)]
pub struct SimulatedClock {
    time_ms: Arc<AtomicU64>,
}

impl Default for SimulatedClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl SimulatedClock {
    pub fn new(start_ms: u64) -> Self {
        SimulatedClock {
            time_ms: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.time_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.time_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }
}

impl Clock for SimulatedClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.time_ms.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock::new();
        let t1 = clock.now();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.now();

        assert!(t2 > t1, "Time should advance");
        assert!(t2.0 - t1.0 >= 10);
    }

    #[test]
    fn test_simulated_clock_deterministic() {
        let clock = SimulatedClock::new(1000);

        assert_eq!(clock.now(), clock.now(), "Time should not advance without explicit call");

        clock.advance_ms(100);
        assert_eq!(clock.now().0, 1100);

        clock.set(5000);
        assert_eq!(clock.now().0, 5000);
    }

    #[test]
    fn test_simulated_clock_shared() {
        let clock = SimulatedClock::new(0);
        let clock2 = clock.clone();

        clock.advance(Duration::from_secs(1));
        assert_eq!(clock2.now().0, 1000, "Clones should share state");
    }

    #[test]
    fn test_elapsed() {
        let clock = SimulatedClock::new(1000);
        let start = clock.now();
        clock.advance_ms(250);
        assert_eq!(clock.elapsed(start), Duration::from_millis(250));
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let ts = Timestamp::from_millis(1000);
        let ts2 = ts + Duration::from_millis(500);
        assert_eq!(ts2.0, 1500);
        assert_eq!(ts2.saturating_sub(ts), Duration::from_millis(500));
        assert_eq!(ts.saturating_sub(ts2), Duration::ZERO);
    }

    #[test]
    fn test_iso8601_format() {
        // 2024-03-01T12:34:56.789Z
        let ts = Timestamp::from_millis(1_709_296_496_789);
        assert_eq!(ts.to_iso8601(), "2024-03-01T12:34:56.789Z");
        assert_eq!(Timestamp::ZERO.to_iso8601(), "1970-01-01T00:00:00.000Z");
    }
}
