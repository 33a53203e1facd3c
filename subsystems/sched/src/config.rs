//! # Scheduler Configuration

use crate::{SchedError, SchedResult, Time};
use tempo_hal::MAX_CPUS;

/// Configuration for the scheduling subsystem
///
/// All times are microseconds.
#[derive(Debug, Clone)]
pub struct SchedConfig {
    /// Number of CPU slots (present CPUs)
    pub max_cpus: usize,
    /// Priority of freshly created scheduling contexts
    pub default_prio: u8,
    /// Priority of the per-CPU kernel (idle) contexts
    pub kernel_prio: u8,
    /// Quantum used when none is given
    pub default_time_slice: Time,
    /// Maximum number of live scheduling contexts
    pub max_contexts: usize,
    /// Maximum number of live scheduling constraints
    pub max_constraints: usize,
    /// Attach a quantum constraint to unconstrained contexts on run-thread
    /// instead of halting
    pub baseline_constraint: bool,
    /// Measurement period of bandwidth constraints created without one
    pub bandwidth_period: Time,
}

impl SchedConfig {
    /// Default time slice: 10ms
    pub const DEFAULT_TIME_SLICE: Time = 10_000;
    /// Default bandwidth measurement period: 1ms
    pub const DEFAULT_BANDWIDTH_PERIOD: Time = 1_000;
    /// Default priority of new contexts
    pub const DEFAULT_PRIO: u8 = 1;
    /// Priority of kernel contexts
    pub const KERNEL_PRIO: u8 = 0;

    /// Create default configuration
    pub fn new() -> Self {
        Self {
            max_cpus: 4,
            default_prio: Self::DEFAULT_PRIO,
            kernel_prio: Self::KERNEL_PRIO,
            default_time_slice: Self::DEFAULT_TIME_SLICE,
            max_contexts: 4096,
            max_constraints: 4096,
            baseline_constraint: false,
            bandwidth_period: Self::DEFAULT_BANDWIDTH_PERIOD,
        }
    }

    /// Single-CPU configuration
    pub fn uniprocessor() -> Self {
        Self {
            max_cpus: 1,
            ..Self::new()
        }
    }

    /// Configuration that gives unconstrained contexts a baseline quantum
    /// constraint instead of halting
    pub fn lenient() -> Self {
        Self {
            baseline_constraint: true,
            ..Self::new()
        }
    }

    /// Set the number of CPU slots
    pub fn with_cpus(mut self, max_cpus: usize) -> Self {
        self.max_cpus = max_cpus;
        self
    }

    /// Set the object quotas
    pub fn with_quota(mut self, max_contexts: usize, max_constraints: usize) -> Self {
        self.max_contexts = max_contexts;
        self.max_constraints = max_constraints;
        self
    }

    /// Set the default time slice
    pub fn with_time_slice(mut self, slice: Time) -> Self {
        self.default_time_slice = slice;
        self
    }

    /// Check the configuration for consistency
    pub fn validate(&self) -> SchedResult<()> {
        if self.max_cpus == 0 || self.max_cpus > MAX_CPUS {
            return Err(SchedError::InvalidArgument);
        }
        if self.default_time_slice == 0 || self.bandwidth_period == 0 {
            return Err(SchedError::InvalidArgument);
        }
        Ok(())
    }
}

impl Default for SchedConfig {
    fn default() -> Self {
        Self::new()
    }
}
