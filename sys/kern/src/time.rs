// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implementation of kernel time.
//!
//! Kernel time is measured in ticks of the periodic tick interrupt, held
//! in a free-running 32-bit counter that is expected to wrap. All
//! comparisons therefore use wrapping arithmetic over a half-range window:
//! a deadline counts as reached once `now - deadline`, as an unsigned
//! difference, is below 2^31. The flip side is that no delay or timeout
//! may exceed [`MAX_DELAY`] ticks; the API layer rejects longer ones.

/// Longest representable delay/timeout, in ticks: 2^31 - 1.
pub const MAX_DELAY: u32 = i32::MAX as u32;

/// In-kernel timestamp, in ticks since scheduler start (mod 2^32).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Default)]
#[repr(transparent)]
pub struct Ticks(pub u32);

impl Ticks {
    pub const ZERO: Self = Ticks(0);

    /// Returns the instant `delta` ticks after `self`, wrapping.
    pub fn offset(self, delta: u32) -> Self {
        Ticks(self.0.wrapping_add(delta))
    }

    /// Treating `self` as "now", checks whether `deadline` has arrived.
    ///
    /// Valid as long as now and the deadline are within half the counter
    /// range of each other, which [`MAX_DELAY`] guarantees.
    pub fn has_reached(self, deadline: Ticks) -> bool {
        self.0.wrapping_sub(deadline.0) <= MAX_DELAY
    }
}

impl From<u32> for Ticks {
    fn from(v: u32) -> Self {
        Ticks(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadline_in_future_is_not_reached() {
        let now = Ticks(100);
        assert!(!now.has_reached(Ticks(101)));
        assert!(!now.has_reached(now.offset(MAX_DELAY)));
    }

    #[test]
    fn deadline_now_or_past_is_reached() {
        let now = Ticks(100);
        assert!(now.has_reached(Ticks(100)));
        assert!(now.has_reached(Ticks(99)));
        assert!(now.has_reached(Ticks(0)));
    }

    #[test]
    fn comparison_survives_counter_wrap() {
        // Deadline set just before wrap, checked just after.
        let before = Ticks(u32::MAX - 2);
        let deadline = before.offset(10);
        assert_eq!(deadline, Ticks(7));
        assert!(!before.has_reached(deadline));
        assert!(Ticks(7).has_reached(deadline));
        assert!(Ticks(8).has_reached(deadline));
        assert!(!Ticks(u32::MAX).has_reached(deadline));
    }

    #[test]
    fn max_delay_round_trip() {
        let now = Ticks(5);
        let deadline = now.offset(MAX_DELAY);
        assert!(!now.has_reached(deadline));
        assert!(deadline.has_reached(deadline));
    }
}
