//! Virtual time representation.

use core::fmt;
use core::ops::Add;

/// A point in time, measured in nanoseconds from the runtime's epoch.
///
/// Under a wall clock the epoch is the moment the runtime was created; under
/// a virtual clock time starts at zero and advances only when the scheduler
/// jumps to the next timer deadline.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The zero point.
    pub const ZERO: Self = Self(0);

    /// Creates a time from nanoseconds.
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Creates a time from milliseconds.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis * 1_000_000)
    }

    /// Returns the time as nanoseconds.
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Returns the time as whole milliseconds.
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0 / 1_000_000
    }

    /// Saturating subtraction.
    #[must_use]
    pub const fn saturating_sub(self, other: Self) -> Self {
        Self(self.0.saturating_sub(other.0))
    }

    /// Returns the later of two times.
    #[must_use]
    pub fn max(self, other: Self) -> Self {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }
}

impl Add for Time {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Time({}ns)", self.0)
    }
}

impl fmt::Display for Time {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_round_trip() {
        let t = Time::from_millis(25);
        assert_eq!(t.as_millis(), 25);
        assert_eq!(t.as_nanos(), 25_000_000);
    }

    #[test]
    fn add_and_saturating_sub() {
        let a = Time::from_millis(10);
        let b = Time::from_millis(3);
        assert_eq!(a + b, Time::from_millis(13));
        assert_eq!(b.saturating_sub(a), Time::ZERO);
    }

    #[test]
    fn ordering() {
        assert!(Time::from_millis(5) < Time::from_millis(10));
        assert_eq!(Time::ZERO.max(Time::from_millis(1)), Time::from_millis(1));
    }
}
