//! Monotonic time: microsecond ticks and pluggable time sources.
//!
//! All timestamps in the crate are read from a monotonic clock expressed as
//! [`Ticks`] (microseconds since the source's epoch). The [`TimeSource`]
//! trait allows components to run against the wall clock in production and
//! against [`VirtualClock`] in deterministic tests.
//!
//! Condition-variable parking uses `std::time::Instant` directly; `Ticks`
//! are for bookkeeping (idle stamps, claim lifetimes, reap thresholds).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// A monotonic timestamp in microseconds since the time source's epoch.
///
/// `Ticks::ZERO` doubles as "never" in claim and resource bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ticks(u64);

impl Ticks {
    /// The zero timestamp.
    pub const ZERO: Self = Self(0);

    /// Creates a timestamp from microseconds.
    #[must_use]
    pub const fn from_micros(micros: u64) -> Self {
        Self(micros)
    }

    /// Returns the timestamp as microseconds.
    #[must_use]
    pub const fn as_micros(self) -> u64 {
        self.0
    }

    /// Returns `true` if this is the zero ("never") timestamp.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Adds a duration, saturating at the maximum representable tick.
    #[must_use]
    pub fn saturating_add(self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_micros() as u64))
    }

    /// Returns the duration elapsed since `earlier`, or zero when `earlier`
    /// is in the future.
    #[must_use]
    pub fn saturating_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.saturating_sub(earlier.0))
    }
}

/// Time source abstraction for reading the current monotonic time.
pub trait TimeSource: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> Ticks;
}

/// Wall clock time source for production use.
///
/// Uses `std::time::Instant` internally; the epoch is the moment the source
/// was created.
#[derive(Debug)]
pub struct WallClock {
    epoch: std::time::Instant,
}

impl WallClock {
    /// Creates a new wall clock time source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: std::time::Instant::now(),
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for WallClock {
    fn now(&self) -> Ticks {
        Ticks(self.epoch.elapsed().as_micros() as u64)
    }
}

/// Virtual time source for deterministic tests.
///
/// Time only advances when explicitly told to, so idle-reaping decisions can
/// be exercised without sleeping.
///
/// # Example
///
/// ```
/// use taskloom::time::{TimeSource, Ticks, VirtualClock};
///
/// let clock = VirtualClock::new();
/// assert_eq!(clock.now(), Ticks::ZERO);
/// clock.advance_micros(1_000_000);
/// assert_eq!(clock.now(), Ticks::from_micros(1_000_000));
/// ```
#[derive(Debug, Default)]
pub struct VirtualClock {
    now: AtomicU64,
}

impl VirtualClock {
    /// Creates a virtual clock starting at time zero.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
        }
    }

    /// Creates a virtual clock starting at the given time.
    #[must_use]
    pub const fn starting_at(time: Ticks) -> Self {
        Self {
            now: AtomicU64::new(time.0),
        }
    }

    /// Advances the clock by the given number of microseconds.
    pub fn advance_micros(&self, micros: u64) {
        self.now.fetch_add(micros, Ordering::SeqCst);
    }

    /// Advances the clock by the given duration.
    pub fn advance(&self, d: Duration) {
        self.advance_micros(d.as_micros() as u64);
    }
}

impl TimeSource for VirtualClock {
    fn now(&self) -> Ticks {
        Ticks(self.now.load(Ordering::SeqCst))
    }
}

/// Returns the process-wide wall clock, shared so all components stamp
/// against the same epoch.
#[must_use]
pub fn wall_clock() -> Arc<dyn TimeSource> {
    static WALL: OnceLock<Arc<WallClock>> = OnceLock::new();
    Arc::clone(WALL.get_or_init(|| Arc::new(WallClock::new()))) as Arc<dyn TimeSource>
}
