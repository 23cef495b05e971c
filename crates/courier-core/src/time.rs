//! Time abstractions for testable timing operations.
//!
//! The dispatcher reads the current time through this trait for visibility
//! checks, lease stamps, and the abandoned-lease cutoff, so tests can drive
//! delayed delivery and lease expiry deterministically.

use std::{
    future::Future,
    pin::Pin,
    time::{Duration, Instant, SystemTime},
};

/// Clock abstraction for time operations.
///
/// Production code uses [`RealClock`]; tests inject a controllable
/// implementation that advances virtual time immediately.
pub trait Clock: Send + Sync {
    /// Returns the current instant for duration measurements.
    fn now(&self) -> Instant;

    /// Returns the current system time for timestamps.
    fn now_system(&self) -> SystemTime;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

/// Real clock implementation using system time and tokio's async sleep.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Current wall-clock time as a UTC timestamp.
///
/// Convenience for the common `DateTime<Utc>` conversion at call sites that
/// hold a `dyn Clock`.
pub fn utc_now(clock: &dyn Clock) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::<chrono::Utc>::from(clock.now_system())
}
