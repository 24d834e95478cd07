// SPDX-License-Identifier: MIT OR Apache-2.0
//! Clock abstraction (spec §4.C step 4), replacing the original
//! `django.utils.timezone.now()` call sites the Python services reached
//! for directly. Tests inject a fixed clock; production uses
//! [`SystemClock`].

use chrono::{DateTime, FixedOffset, Utc};

/// Supplies the current instant. Exists so `RecordBuilder` and the
/// administrative operations that stamp events never call a wall-clock
/// function directly, keeping every timestamp in this workspace traceable
/// to an injected value in tests.
pub trait Clock: Send + Sync {
    /// The current instant, with a UTC offset.
    fn now(&self) -> DateTime<FixedOffset>;
}

/// The real clock, backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&FixedOffset::east_opt(0).unwrap())
    }
}

/// A fixed clock for tests, advanced explicitly.
#[cfg(test)]
pub struct FixedClock(pub std::sync::Mutex<DateTime<FixedOffset>>);

#[cfg(test)]
impl FixedClock {
    /// A fixed clock starting at `instant`.
    #[must_use]
    pub fn new(instant: DateTime<FixedOffset>) -> Self {
        Self(std::sync::Mutex::new(instant))
    }

    /// Advance the clock by `seconds`.
    pub fn advance(&self, seconds: i64) {
        let mut guard = self.0.lock().unwrap();
        *guard += chrono::Duration::seconds(seconds);
    }
}

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> DateTime<FixedOffset> {
        *self.0.lock().unwrap()
    }
}
