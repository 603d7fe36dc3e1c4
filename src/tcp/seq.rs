//! Support for TCP sequence numbers.

use std::fmt::{self, Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// Represents a TCP sequence number. A sequence number advances modulo 2^32, comparisons are made
/// relative to each other across the signed overflow, not as raw unsigned integers.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub struct SeqNum(u32);

impl SeqNum {
    /// Creates a new `SeqNum`.
    pub const fn new(n: u32) -> SeqNum {
        SeqNum(n)
    }

    /// Returns the raw value of the sequence number.
    pub fn get(self) -> u32 {
        self.0
    }

    /// Returns the signed distance from `other` to `self`.
    pub fn distance(self, other: SeqNum) -> i32 {
        self.0.wrapping_sub(other.0) as i32
    }

    /// Returns if the sequence number is before `other`.
    pub fn before(self, other: SeqNum) -> bool {
        self.distance(other) < 0
    }

    /// Returns if the sequence number is before or equal to `other`.
    pub fn before_or_eq(self, other: SeqNum) -> bool {
        self.distance(other) <= 0
    }

    /// Returns if the sequence number is after `other`.
    pub fn after(self, other: SeqNum) -> bool {
        self.distance(other) > 0
    }

    /// Returns if the sequence number is after or equal to `other`.
    pub fn after_or_eq(self, other: SeqNum) -> bool {
        self.distance(other) >= 0
    }

    /// Returns if the sequence number is in `[begin, end)`.
    pub fn within(self, begin: SeqNum, end: SeqNum) -> bool {
        self.after_or_eq(begin) && self.before(end)
    }

    /// Returns the later one of two sequence numbers.
    pub fn max(self, other: SeqNum) -> SeqNum {
        match self.after(other) {
            true => self,
            false => other,
        }
    }
}

impl Add<u32> for SeqNum {
    type Output = SeqNum;

    fn add(self, rhs: u32) -> SeqNum {
        SeqNum(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SeqNum {
    fn add_assign(&mut self, rhs: u32) {
        *self = *self + rhs;
    }
}

impl Sub<u32> for SeqNum {
    type Output = SeqNum;

    fn sub(self, rhs: u32) -> SeqNum {
        SeqNum(self.0.wrapping_sub(rhs))
    }
}

impl From<u32> for SeqNum {
    fn from(n: u32) -> SeqNum {
        SeqNum(n)
    }
}

impl Display for SeqNum {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[test]
fn seq_num_wraparound() {
    let a = SeqNum::new(u32::MAX - 1);
    let b = a + 4;
    assert_eq!(b.get(), 2);
    assert!(a.before(b));
    assert!(b.after(a));
    assert_eq!(b.distance(a), 4);
    assert_eq!(a.distance(b), -4);
    assert_eq!(b - 4, a);
    assert_eq!(a.max(b), b);
}

#[test]
fn seq_num_within() {
    let begin = SeqNum::new(u32::MAX - 10);
    let end = begin + 20;
    assert!(SeqNum::new(u32::MAX).within(begin, end));
    assert!(SeqNum::new(5).within(begin, end));
    assert!(!end.within(begin, end));
    assert!(!SeqNum::new(u32::MAX - 11).within(begin, end));
}
