//! # Tempo HAL - Hardware Abstraction Layer
//!
//! The scheduling core treats the platform as a set of collaborators it
//! calls into. This crate defines those seams:
//!
//! - **CPU identifiers and sets**: [`cpu::CpuId`], [`cpu::CpuMask`] and the
//!   L4-style [`cpu::CpuSet`] descriptor carried in scheduling parameters
//! - **Clock and one-shot timer**: [`timer::Clock`], with the host-side
//!   [`timer::ManualClock`] used for simulation and tests
//! - **Performance counters**: [`perf::PerfCounters`], used to measure
//!   memory bandwidth per CPU
//!
//! All times are microseconds of the system clock.

#![cfg_attr(not(test), no_std)]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

extern crate alloc;

pub mod cpu;
pub mod perf;
pub mod timer;

pub use cpu::{CpuId, CpuMask, CpuSet, MAX_CPUS};
pub use timer::{Clock, ManualClock};

/// Absolute point on the system clock, in microseconds
pub type Time = u64;

/// Signed distance between two points on the system clock, in microseconds
pub type TimeDelta = i64;

/// Result type for HAL operations
pub type HalResult<T> = Result<T, HalError>;

/// Errors that can occur in HAL operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// The operation is not supported on this platform
    NotSupported,
    /// Invalid parameter provided
    InvalidParameter,
    /// CPU index outside the supported range
    InvalidCpu,
}

/// Signed difference `a - b`, saturating at the `i64` range.
#[inline]
pub fn time_diff(a: Time, b: Time) -> TimeDelta {
    if a >= b {
        i64::try_from(a - b).unwrap_or(i64::MAX)
    } else {
        i64::try_from(b - a).map(|d| -d).unwrap_or(i64::MIN)
    }
}
