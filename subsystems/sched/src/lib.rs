//! # Tempo Scheduling Subsystem
//!
//! Fixed-priority real-time scheduling with pluggable scheduling
//! constraints:
//! - Per-CPU ready queues with O(1) highest-priority lookup
//! - Scheduling contexts binding a priority to one thread
//! - Scheduling constraints (gate, quantum, budget, time window,
//!   bandwidth) layered on top of priority scheduling
//! - A per-CPU timeslice timeout driving preemption
//! - The invocation surface used by user space to manage all of the above
//!
//! ## Locking
//!
//! All scheduling state lives in one [`scheduler::Scheduler`] object. The
//! kernel keeps it behind the global lock in [`global`], which plays the
//! role of the CPU lock. Attach and detach additionally take the per-context
//! slot lock; the order is always scheduler lock first.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod config;
pub mod constraint;
pub mod context;
pub mod factory;
pub mod global;
pub mod hotplug;
pub mod invoke;
pub mod metrics;
pub mod object;
pub mod percpu;
pub mod priority;
pub mod ready_queue;
pub mod scheduler;
pub mod thread;
pub mod timeout;

#[cfg(test)]
mod tests;

pub use config::SchedConfig;
pub use constraint::{ConstraintParams, ConstraintType};
pub use priority::Priority;
pub use scheduler::Scheduler;
pub use tempo_hal::{CpuId, CpuSet, Time, TimeDelta};

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

/// Unique identifier for threads (execution contexts)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Create a new thread ID
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Create from raw value
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Default for ThreadId {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle of a scheduling context
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScId(u64);

/// Handle of a scheduling constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConstraintId(u64);

macro_rules! object_key {
    ($ty:ident, $tag:literal) => {
        impl object::ObjectKey for $ty {
            fn from_raw(raw: u64) -> Self {
                Self(raw)
            }

            fn raw(self) -> u64 {
                self.0
            }
        }

        impl $ty {
            /// Create from raw value
            pub const fn from_raw(value: u64) -> Self {
                Self(value)
            }

            /// Get the raw handle value
            pub fn as_u64(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "[{}]"), self.0)
            }
        }
    };
}

object_key!(ScId, "SCX");
object_key!(ConstraintId, "SC");

/// Scheduling result type
pub type SchedResult<T> = Result<T, SchedError>;

/// Scheduling errors returned to callers
///
/// Kernel-internal invariant violations are not represented here; they
/// halt instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Malformed message, unknown type tag or parameter out of range
    InvalidArgument,
    /// Index outside the supported range (e.g. CPU-set offset)
    OutOfRange,
    /// No free constraint slot, or object quota exhausted
    OutOfMemory,
    /// Object does not exist or is not attached
    NotFound,
    /// Operation not provided by this object
    NotImplemented,
    /// Insufficient rights on a capability
    PermissionDenied,
    /// Object is in the wrong state for this operation
    InvalidState,
}

impl SchedError {
    /// Negative error number reported back through the invocation reply
    pub const fn code(self) -> i64 {
        match self {
            SchedError::PermissionDenied => -1,
            SchedError::NotFound => -2,
            SchedError::OutOfMemory => -12,
            SchedError::InvalidState => -16,
            SchedError::InvalidArgument => -22,
            SchedError::OutOfRange => -34,
            SchedError::NotImplemented => -38,
        }
    }
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            SchedError::InvalidArgument => "invalid argument",
            SchedError::OutOfRange => "out of range",
            SchedError::OutOfMemory => "out of memory",
            SchedError::NotFound => "not found",
            SchedError::NotImplemented => "not implemented",
            SchedError::PermissionDenied => "permission denied",
            SchedError::InvalidState => "invalid state",
        };
        f.write_str(text)
    }
}

impl From<tempo_hal::HalError> for SchedError {
    fn from(err: tempo_hal::HalError) -> Self {
        match err {
            tempo_hal::HalError::InvalidCpu => SchedError::OutOfRange,
            tempo_hal::HalError::NotSupported => SchedError::NotImplemented,
            tempo_hal::HalError::InvalidParameter => SchedError::InvalidArgument,
        }
    }
}
