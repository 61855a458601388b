//! 802.11 sequence number arithmetic.
//!
//! Sequence numbers live in a 12-bit space and wrap around. Ordering between two sequence numbers
//! is only meaningful, if they are less than half the space apart, which is why [SeqNum] doesn't
//! implement [PartialOrd].
use core::ops::{Add, Sub};

/// A 12-bit sequence number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SeqNum(u16);
impl SeqNum {
    /// The size of the sequence number space.
    pub const MODULO: u16 = 4096;
    /// The mask applied to raw values.
    pub const MASK: u16 = Self::MODULO - 1;
    /// Half of the sequence number space.
    pub const HALF: u16 = Self::MODULO / 2;

    /// Create a new sequence number, discarding everything above the lower 12 bits.
    pub const fn new(raw: u16) -> Self {
        Self(raw & Self::MASK)
    }
    /// The raw value.
    pub const fn value(self) -> u16 {
        self.0
    }
    pub const fn wrapping_add(self, rhs: u16) -> Self {
        Self::new(self.0.wrapping_add(rhs))
    }
    pub const fn wrapping_sub(self, rhs: u16) -> Self {
        Self::new(self.0.wrapping_sub(rhs))
    }
    /// The number of steps needed to get from `base` to `self`.
    pub const fn distance_from(self, base: Self) -> u16 {
        self.0.wrapping_sub(base.0) & Self::MASK
    }
    /// Check if `self` comes before or is equal to `other`.
    pub const fn precedes_or_eq(self, other: Self) -> bool {
        (self.0 <= other.0 && other.0 - self.0 < Self::HALF)
            || (self.0 > other.0 && self.0 - other.0 >= Self::HALF)
    }
    /// Check if `self` comes strictly before `other`.
    pub const fn precedes(self, other: Self) -> bool {
        self.0 != other.0 && self.precedes_or_eq(other)
    }
    /// Check if `self` is in `[start, start + size)`.
    pub const fn is_within(self, start: Self, size: u16) -> bool {
        self.distance_from(start) < size
    }
}
impl From<u16> for SeqNum {
    fn from(value: u16) -> Self {
        Self::new(value)
    }
}
impl From<SeqNum> for u16 {
    fn from(value: SeqNum) -> Self {
        value.0
    }
}
impl Add<u16> for SeqNum {
    type Output = Self;
    fn add(self, rhs: u16) -> Self::Output {
        self.wrapping_add(rhs)
    }
}
impl Sub<u16> for SeqNum {
    type Output = Self;
    fn sub(self, rhs: u16) -> Self::Output {
        self.wrapping_sub(rhs)
    }
}
