//! Time abstraction for the registry core.
//!
//! Liveness aging and ID recycling are driven entirely by elapsed monotonic
//! time, so the clock is a trait seam: production uses the system clock, the
//! test suite swaps in a manually advanced one and replays whole lifecycles
//! in microseconds.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::Instant;

/// Monotonic + wall-clock time source.
///
/// Monotonic readings are milliseconds since an arbitrary origin. They are
/// only ever compared against each other (heartbeat deltas, reservation
/// ages), never interpreted as wall time.
pub trait Clock: Send + Sync {
    /// Milliseconds on the monotonic clock.
    fn mono_ms(&self) -> u64;

    /// Current wall-clock time.
    fn wall(&self) -> DateTime<Utc>;
}

/// Production clock backed by `Instant` and `chrono::Utc`.
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn mono_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
///
/// Wall time tracks the monotonic offset from a fixed epoch so that
/// wall-clock-based logic (registration dedup, `updatedAt`) moves in step
/// with monotonic advances.
pub struct ManualClock {
    state: Mutex<ManualState>,
}

struct ManualState {
    mono_ms: u64,
    wall_origin: DateTime<Utc>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManualState {
                mono_ms: 0,
                wall_origin: Utc::now(),
            }),
        }
    }

    /// Advance both clocks by the given number of milliseconds.
    pub fn advance_ms(&self, ms: u64) {
        self.state.lock().mono_ms += ms;
    }

    /// Advance both clocks by whole seconds.
    pub fn advance_secs(&self, secs: u64) {
        self.advance_ms(secs * 1000);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn mono_ms(&self) -> u64 {
        self.state.lock().mono_ms
    }

    fn wall(&self) -> DateTime<Utc> {
        let state = self.state.lock();
        state.wall_origin + chrono::Duration::milliseconds(state.mono_ms as i64)
    }
}
