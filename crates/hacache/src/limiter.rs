//! A counted admission gate bounding concurrent executions of the wrapped
//! computation.
//!
//! This is deliberately not a fair semaphore: there is no queueing and no
//! wakeup. An attempt either fits under the ceiling right now or is
//! rejected, and rejected callers are expected to fall back (serve stale
//! data, surface [`Error::FnRunLimited`](crate::Error::FnRunLimited), or
//! drop a background refresh).

use std::sync::atomic::{AtomicI32, Ordering};

/// Lock-free concurrency gate with a hard ceiling.
///
/// A `max` of zero or less disables the gate: every [`acquire`](Self::acquire)
/// succeeds and [`current`](Self::current) stays at zero.
#[derive(Debug)]
pub struct Limiter {
    current: AtomicI32,
    max: i32,
}

impl Limiter {
    pub fn new(max: i32) -> Self {
        Limiter {
            current: AtomicI32::new(0),
            max,
        }
    }

    /// Attempts to admit `n` more executions.
    ///
    /// Returns the occupancy after the increment and whether the attempt
    /// was admitted. A rejected attempt returns `(-1, false)` but has
    /// still incremented the occupancy: the caller must pair every
    /// `acquire` with a [`release`](Self::release), admitted or not.
    pub fn acquire(&self, n: i32) -> (i32, bool) {
        if self.max <= 0 {
            return (0, true);
        }

        let current = self.current.fetch_add(n, Ordering::AcqRel) + n;
        if current > self.max {
            return (-1, false);
        }

        (current, true)
    }

    /// Releases `n` previously acquired slots.
    pub fn release(&self, n: i32) {
        if self.max <= 0 {
            return;
        }

        self.current.fetch_sub(n, Ordering::AcqRel);
    }

    /// Current occupancy, including not-yet-released rejected attempts.
    pub fn current(&self) -> i32 {
        if self.max <= 0 {
            return 0;
        }

        self.current.load(Ordering::Acquire)
    }
}
