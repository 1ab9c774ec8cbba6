//! A single "now" provider.
//!
//! Spec §4.F requires all timestamp arithmetic to use timezone-aware
//! instants, centralized behind one provider, rather than sprinkling
//! `Utc::now()` (or worse, naive `Instant`) across health-check code.

use chrono::{DateTime, Utc};

/// Supplies the current instant. Production code uses `SystemClock`;
/// tests use a fixed clock so heartbeat-age assertions are deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a fixed instant, for deterministic tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}
