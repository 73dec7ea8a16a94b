//! Wrapping millisecond timestamps
//!
//! All client-visible time in the mixer is an unsigned 32-bit millisecond
//! counter. The counter wraps after ~49.7 days; comparisons therefore use
//! signed differences, which give the correct ordering for any two timestamps
//! less than ~24.8 days apart. Event timestamps are additionally clipped to a
//! window around the current wall time (see [`Timestamp::clip`]), which keeps
//! every difference the mixer computes far inside the signed range.

use std::time::Instant;

/// Maximum distance, in milliseconds, an event timestamp may lie from the
/// current wall time. Timestamps outside the window are clipped to its edge.
pub const MAX_EVENT_DELTA_MS: i32 = 3_600_000; // one hour

/// A wrapping millisecond timestamp.
///
/// Ordering is deliberately not derived: `a < b` is meaningless on a wrapping
/// counter. Use [`Timestamp::delta`] or [`Timestamp::is_before`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Timestamp(u32);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    /// Construct from a raw millisecond counter value.
    pub const fn from_millis(ms: u32) -> Self {
        Timestamp(ms)
    }

    /// The raw millisecond counter value.
    pub const fn millis(self) -> u32 {
        self.0
    }

    /// Signed difference `self - earlier` in milliseconds.
    ///
    /// Correct across counter wrap as long as the two timestamps are less
    /// than `i32::MAX` milliseconds apart.
    pub const fn delta(self, earlier: Timestamp) -> i32 {
        self.0.wrapping_sub(earlier.0) as i32
    }

    /// True if `self` is strictly before `other` in wrapped order.
    pub const fn is_before(self, other: Timestamp) -> bool {
        self.delta(other) < 0
    }

    /// Earlier of the two times.
    pub const fn earliest(self, other: Timestamp) -> Timestamp {
        if self.delta(other) < 0 {
            self
        } else {
            other
        }
    }

    /// Later of the two times.
    pub const fn latest(self, other: Timestamp) -> Timestamp {
        if self.delta(other) < 0 {
            other
        } else {
            self
        }
    }

    /// Advance by a signed millisecond offset, wrapping.
    pub const fn offset(self, ms: i32) -> Timestamp {
        Timestamp(self.0.wrapping_add(ms as u32))
    }

    /// Clip to within [`MAX_EVENT_DELTA_MS`] of `reference`.
    ///
    /// Keeps hostile or buggy client timestamps from producing differences
    /// that leave the signed-comparison window.
    pub fn clip(self, reference: Timestamp) -> Timestamp {
        let delta = self.delta(reference);
        if delta > MAX_EVENT_DELTA_MS {
            reference.offset(MAX_EVENT_DELTA_MS)
        } else if delta < -MAX_EVENT_DELTA_MS {
            reference.offset(-MAX_EVENT_DELTA_MS)
        } else {
            self
        }
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Monotonic wall-clock source producing [`Timestamp`] values.
///
/// The mixer never reads a clock itself; clients sample one of these and pass
/// the result to `set_time` / `process`. Two clocks created at different
/// instants produce different counters, which is fine — only differences
/// matter.
#[derive(Debug, Clone)]
pub struct WallClock {
    origin: Instant,
}

impl WallClock {
    pub fn new() -> Self {
        WallClock {
            origin: Instant::now(),
        }
    }

    /// Milliseconds elapsed since the clock was created, wrapped to u32.
    pub fn now(&self) -> Timestamp {
        Timestamp(self.origin.elapsed().as_millis() as u32)
    }
}

impl Default for WallClock {
    fn default() -> Self {
        WallClock::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_is_signed() {
        let a = Timestamp::from_millis(1000);
        let b = Timestamp::from_millis(1500);
        assert_eq!(b.delta(a), 500);
        assert_eq!(a.delta(b), -500);
    }

    #[test]
    fn delta_across_wrap() {
        let before = Timestamp::from_millis(u32::MAX - 10);
        let after = Timestamp::from_millis(20);
        assert_eq!(after.delta(before), 31);
        assert_eq!(before.delta(after), -31);
        assert!(before.is_before(after));
    }

    #[test]
    fn earliest_latest_across_wrap() {
        let before = Timestamp::from_millis(u32::MAX - 3);
        let after = Timestamp::from_millis(5);
        assert_eq!(before.earliest(after), before);
        assert_eq!(before.latest(after), after);
    }

    #[test]
    fn offset_wraps() {
        let t = Timestamp::from_millis(5);
        assert_eq!(t.offset(-10).millis(), u32::MAX - 4);
        assert_eq!(t.offset(-10).offset(10), t);
    }

    #[test]
    fn clip_bounds_runaway_timestamps() {
        let now = Timestamp::from_millis(50_000_000);
        let far_future = now.offset(MAX_EVENT_DELTA_MS + 1);
        let far_past = now.offset(-(MAX_EVENT_DELTA_MS + 1));
        assert_eq!(far_future.clip(now).delta(now), MAX_EVENT_DELTA_MS);
        assert_eq!(far_past.clip(now).delta(now), -MAX_EVENT_DELTA_MS);

        let near = now.offset(1234);
        assert_eq!(near.clip(now), near);
    }

    #[test]
    fn wall_clock_is_monotonic() {
        let clock = WallClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b.delta(a) >= 0);
    }
}
