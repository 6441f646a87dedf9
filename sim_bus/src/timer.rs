//! # Bus Clocks
//!
//! Reply deadlines are measured against a [`BusClock`].
//!
//! ## Philosophy
//!
//! **Determinism enables thorough testing.**
//!
//! [`SimClock`] only advances when explicitly told to, so reply timeouts
//! fire exactly when a test says they should. [`MonotonicClock`] follows
//! wall time for buses that run outside of tests.
//!
//! Blocking receives always wait in wall time; only reply deadlines follow
//! the bus clock. A receiver blocked on a wall-time bus also wakes when
//! one of its own reply deadlines falls due.

use bus_api::{Duration, Instant};
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of bus time
pub trait BusClock: Send + Sync {
    /// Returns the current bus time
    fn now(&self) -> Instant;

    /// Moves time forward by `by`
    ///
    /// Wall clocks cannot be moved and ignore this.
    fn advance(&self, _by: Duration) {}

    /// Wall time at which the bus clock reaches `at`
    ///
    /// `None` for clocks that do not follow wall time.
    fn wall_deadline(&self, _at: Instant) -> Option<std::time::Instant> {
        None
    }
}

/// Simulated clock with explicit time progression
///
/// # Examples
///
/// ```
/// use sim_bus::timer::{BusClock, SimClock};
/// use bus_api::{Duration, Instant};
///
/// let clock = SimClock::new();
/// assert_eq!(clock.now(), Instant::ZERO);
///
/// clock.advance(Duration::from_millis(100));
/// assert_eq!(clock.now(), Instant::from_nanos(100_000_000));
/// ```
#[derive(Debug, Default)]
pub struct SimClock {
    nanos: AtomicU64,
}

impl SimClock {
    /// Creates a clock at time zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a clock starting at `start`
    pub fn starting_at(start: Instant) -> Self {
        Self {
            nanos: AtomicU64::new(start.as_nanos()),
        }
    }
}

impl BusClock for SimClock {
    fn now(&self) -> Instant {
        Instant::from_nanos(self.nanos.load(Ordering::Acquire))
    }

    /// Saturates at the end of time
    fn advance(&self, by: Duration) {
        let _ = self
            .nanos
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |nanos| {
                Some(nanos.saturating_add(by.as_nanos()))
            });
    }
}

/// Wall-time clock, zero at construction
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: std::time::Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: std::time::Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl BusClock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::ZERO + Duration::from(self.origin.elapsed())
    }

    fn wall_deadline(&self, at: Instant) -> Option<std::time::Instant> {
        self.origin
            .checked_add(std::time::Duration::from_nanos(at.as_nanos()))
    }
}
