//! Injectable wall-clock abstraction.
//!
//! Every timestamp the engine writes or compares (`created_at`, `due_time_utc`,
//! `locked_until`, lease expiries, provider refresh) flows through a [`Clock`]
//! so tests can steer eligibility without sleeping. Production code uses
//! [`SystemClock`]; tests use [`ManualClock`] and advance it explicitly.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};

/// A source of UTC time.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// The real wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Returns a shared [`SystemClock`].
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

/// A hand-driven clock for tests.
///
/// Cloning shares the underlying instant, so a clock handed to a store keeps
/// tracking advances made from the test body.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<std::sync::Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Starts the clock at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(std::sync::Mutex::new(start)),
        }
    }

    /// Starts the clock at the current wall time.
    pub fn from_system() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().expect("clock mutex poisoned");
        *now += by;
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().expect("clock mutex poisoned") = to;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}
