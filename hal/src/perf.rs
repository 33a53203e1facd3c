//! # Performance Counters
//!
//! Per-CPU event counters used to measure memory bandwidth. The scheduler
//! loads a counter with the remaining event budget; the counter raises an
//! overflow interrupt once the budget is consumed.

use crate::CpuId;

/// Hardware counter slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Counter {
    /// Counts read traffic
    Read = 0,
    /// Counts write traffic
    Write = 1,
}

impl Counter {
    /// Both counters, in slot order
    pub const ALL: [Counter; 2] = [Counter::Read, Counter::Write];

    /// Slot index
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// Architectural cache event numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum PerfEvent {
    /// Level 2 data cache refill (read traffic to memory)
    L2dCacheRefill = 0x17,
    /// Level 2 data cache write-back (write traffic to memory)
    L2dCacheWb = 0x18,
}

impl PerfEvent {
    /// Event measured by a counter slot
    pub const fn for_counter(counter: Counter) -> Self {
        match counter {
            Counter::Read => PerfEvent::L2dCacheRefill,
            Counter::Write => PerfEvent::L2dCacheWb,
        }
    }
}

/// Per-CPU performance monitoring unit
pub trait PerfCounters: Send + Sync {
    /// Bind a counter to an event and enable its overflow interrupt
    fn setup(&self, cpu: CpuId, counter: Counter, event: PerfEvent);

    /// Load a counter with the number of events left before overflow
    fn write(&self, cpu: CpuId, counter: Counter, remaining: u64);

    /// Acknowledge a pending overflow interrupt
    fn ack_overflow(&self, cpu: CpuId, counter: Counter);
}

/// Platform without performance counters
#[derive(Debug, Clone, Copy, Default)]
pub struct NullPerfCounters;

impl PerfCounters for NullPerfCounters {
    fn setup(&self, _cpu: CpuId, _counter: Counter, _event: PerfEvent) {}

    fn write(&self, _cpu: CpuId, _counter: Counter, _remaining: u64) {}

    fn ack_overflow(&self, _cpu: CpuId, _counter: Counter) {}
}
