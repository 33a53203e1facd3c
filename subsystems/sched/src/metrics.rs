//! # Scheduler Metrics
//!
//! Counters for scheduler activity, readable without taking the scheduler
//! lock.

use core::sync::atomic::{AtomicU64, Ordering};

/// Scheduler metrics
#[derive(Debug)]
pub struct SchedulerMetrics {
    /// Changes of the active context on any CPU
    context_switches: AtomicU64,
    /// Dispatched timer expirations
    timer_expirations: AtomicU64,
    /// Reschedule passes that displaced a still-runnable context
    preemptions: AtomicU64,
    /// Home-CPU changes of scheduling contexts
    migrations: AtomicU64,
    /// Contexts registered as blocked on a constraint
    blocks: AtomicU64,
    /// Contexts released from a constraint's blocked list
    releases: AtomicU64,
    /// Budget overruns (timeout observed with negative remaining time)
    budget_overruns: AtomicU64,
    /// Budget exhaustions
    exhaustions: AtomicU64,
    /// Budget replenishments
    replenishments: AtomicU64,
    /// Bandwidth throttle events
    throttles: AtomicU64,
}

impl SchedulerMetrics {
    /// Create new metrics
    pub const fn new() -> Self {
        Self {
            context_switches: AtomicU64::new(0),
            timer_expirations: AtomicU64::new(0),
            preemptions: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
            blocks: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            budget_overruns: AtomicU64::new(0),
            exhaustions: AtomicU64::new(0),
            replenishments: AtomicU64::new(0),
            throttles: AtomicU64::new(0),
        }
    }

    /// Record a context switch
    pub fn record_context_switch(&self) {
        self.context_switches.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a dispatched timer expiration
    pub fn record_timer_expiration(&self) {
        self.timer_expirations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a preemption
    pub fn record_preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a migration
    pub fn record_migration(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a block on a constraint
    pub fn record_block(&self) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a release from a constraint
    pub fn record_release(&self) {
        self.releases.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a budget overrun
    pub fn record_budget_overrun(&self) {
        self.budget_overruns.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a budget exhaustion
    pub fn record_exhaustion(&self) {
        self.exhaustions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a budget replenishment
    pub fn record_replenishment(&self) {
        self.replenishments.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a bandwidth throttle
    pub fn record_throttle(&self) {
        self.throttles.fetch_add(1, Ordering::Relaxed);
    }

    /// Get total context switches
    pub fn context_switches(&self) -> u64 {
        self.context_switches.load(Ordering::Relaxed)
    }

    /// Get dispatched timer expirations
    pub fn timer_expirations(&self) -> u64 {
        self.timer_expirations.load(Ordering::Relaxed)
    }

    /// Get preemptions
    pub fn preemptions(&self) -> u64 {
        self.preemptions.load(Ordering::Relaxed)
    }

    /// Get migrations
    pub fn migrations(&self) -> u64 {
        self.migrations.load(Ordering::Relaxed)
    }

    /// Get blocks
    pub fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    /// Get releases
    pub fn releases(&self) -> u64 {
        self.releases.load(Ordering::Relaxed)
    }

    /// Get budget overruns
    pub fn budget_overruns(&self) -> u64 {
        self.budget_overruns.load(Ordering::Relaxed)
    }

    /// Get budget exhaustions
    pub fn exhaustions(&self) -> u64 {
        self.exhaustions.load(Ordering::Relaxed)
    }

    /// Get budget replenishments
    pub fn replenishments(&self) -> u64 {
        self.replenishments.load(Ordering::Relaxed)
    }

    /// Get bandwidth throttles
    pub fn throttles(&self) -> u64 {
        self.throttles.load(Ordering::Relaxed)
    }

    /// Reset all metrics
    pub fn reset(&self) {
        self.context_switches.store(0, Ordering::Relaxed);
        self.timer_expirations.store(0, Ordering::Relaxed);
        self.preemptions.store(0, Ordering::Relaxed);
        self.migrations.store(0, Ordering::Relaxed);
        self.blocks.store(0, Ordering::Relaxed);
        self.releases.store(0, Ordering::Relaxed);
        self.budget_overruns.store(0, Ordering::Relaxed);
        self.exhaustions.store(0, Ordering::Relaxed);
        self.replenishments.store(0, Ordering::Relaxed);
        self.throttles.store(0, Ordering::Relaxed);
    }
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
