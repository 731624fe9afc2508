use chrono::{DateTime, Utc};
use std::cell::Cell;
use std::rc::Rc;

/// Monotonic time source for the runtime. The engine never blocks on the
/// clock; ticks arrive as external events and the clock only answers `now`.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a single instant at construction.
///
/// Threaded through a `pop → parent.next → push child` chain so every
/// timing field stamped along the chain reads the same instant, and used to
/// seed an execution turn so all actions inside it observe one clock.
#[derive(Clone, Copy, Debug)]
pub struct SnapshotClock {
    instant: DateTime<Utc>,
}

impl SnapshotClock {
    pub fn at(instant: DateTime<Utc>) -> Self {
        Self { instant }
    }

    /// Freeze another clock at its current instant.
    pub fn freeze(clock: &dyn Clock) -> Self {
        Self {
            instant: clock.now(),
        }
    }
}

impl Clock for SnapshotClock {
    fn now(&self) -> DateTime<Utc> {
        self.instant
    }
}

/// A settable clock for simulated runs and tests. Single-threaded by
/// design, like the rest of the runtime.
#[derive(Clone, Debug)]
pub struct ManualClock {
    instant: Rc<Cell<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn starting_at(instant: DateTime<Utc>) -> Self {
        Self {
            instant: Rc::new(Cell::new(instant)),
        }
    }

    pub fn set(&self, instant: DateTime<Utc>) {
        self.instant.set(instant);
    }

    pub fn advance_ms(&self, ms: i64) -> DateTime<Utc> {
        let next = self.instant.get() + chrono::Duration::milliseconds(ms);
        self.instant.set(next);
        next
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.instant.get()
    }
}
