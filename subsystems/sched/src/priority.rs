//! # Priority Management
//!
//! Fixed priorities 0-255; a higher number preempts a lower one.

use core::fmt;

/// Number of distinct priority levels
pub const PRIORITIES: usize = 256;

/// Scheduling priority
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority (kernel/idle level)
    pub const MIN: Self = Self(0);

    /// Highest priority
    pub const MAX: Self = Self(u8::MAX);

    /// Create a priority
    #[inline]
    pub const fn new(value: u8) -> Self {
        Self(value)
    }

    /// Create a priority from a message word, clamping to 255
    pub fn clamped(value: u64) -> Self {
        Self(u8::try_from(value).unwrap_or(u8::MAX))
    }

    /// Raw priority value
    #[inline]
    pub const fn value(self) -> u8 {
        self.0
    }

    /// Bucket index in a ready queue
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Strict preemption order: `self` may preempt `other`
    ///
    /// Equal priorities never dominate each other.
    #[inline]
    pub const fn dominates(self, other: Self) -> bool {
        self.0 > other.0
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self(value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "prio {}", self.0)
    }
}
