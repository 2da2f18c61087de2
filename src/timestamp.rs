//! Strictly monotonic timestamp generation shared across upload sessions.
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

pub type NanosProvider = Box<dyn Fn() -> i64 + Send + Sync>;

/// Issues strictly increasing event timestamps in nanoseconds.
///
/// One generator is shared (via `Arc`) by every session and request builder in
/// the process so that event order is preserved even when the system clock
/// stalls or steps backwards.
pub struct TimestampGenerator {
    last: Mutex<i64>,
    nanos_provider: NanosProvider,
}

impl TimestampGenerator {
    /// Create a generator backed by the system clock.
    pub fn new() -> Self {
        Self::with_provider(Box::new(system_nanos_provider))
    }

    /// Create a generator with a custom nanosecond clock.
    pub fn with_provider(nanos_provider: NanosProvider) -> Self {
        Self {
            last: Mutex::new(0),
            nanos_provider,
        }
    }

    /// Return a timestamp strictly greater than every previously issued one.
    ///
    /// Reads the clock and substitutes `last + 1` whenever the reading does
    /// not advance past the previous value.
    pub fn next(&self) -> i64 {
        let mut last = self.last.lock();
        let candidate = (self.nanos_provider)();
        let issued = if candidate <= *last {
            *last + 1
        } else {
            candidate
        };
        *last = issued;
        issued
    }
}

impl Default for TimestampGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the current time in nanoseconds since the UNIX epoch.
///
/// Returns 0 if the system clock is before the UNIX epoch.
pub fn system_nanos_provider() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
