//! # System Clock and One-Shot Timer
//!
//! The scheduler reads time from a monotonic system clock and programs one
//! one-shot deadline per CPU. When the deadline passes, the platform's timer
//! interrupt handler calls back into the scheduler on that CPU.

use crate::{CpuId, Time, MAX_CPUS};
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

/// Monotonic clock with a per-CPU one-shot timer
pub trait Clock: Send + Sync {
    /// Current time of the system clock
    fn now(&self) -> Time;

    /// Program the one-shot timer of `cpu` (`None` disarms it)
    fn program(&self, cpu: CpuId, deadline: Option<Time>);
}

/// Clock driven by hand
///
/// Used for host-side simulation: time only moves when `set` or `advance`
/// is called, and every programmed deadline is recorded so a driver loop
/// can jump straight to the next timer interrupt.
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
    programmed: Mutex<Vec<Option<Time>>>,
}

impl ManualClock {
    /// Create a clock reading `start`
    pub fn new(start: Time) -> Self {
        Self {
            now: AtomicU64::new(start),
            programmed: Mutex::new(vec![None; MAX_CPUS]),
        }
    }

    /// Jump to an absolute time (never backwards)
    pub fn set(&self, time: Time) {
        let prev = self.now.fetch_max(time, Ordering::SeqCst);
        if prev > time {
            log::warn!("[clock] refusing to move backwards from {} to {}", prev, time);
        }
    }

    /// Move the clock forward
    pub fn advance(&self, delta: Time) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    /// Deadline last programmed for `cpu`
    pub fn programmed(&self, cpu: CpuId) -> Option<Time> {
        self.programmed.lock().get(cpu.index()).copied().flatten()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        self.now.load(Ordering::SeqCst)
    }

    fn program(&self, cpu: CpuId, deadline: Option<Time>) {
        if let Some(slot) = self.programmed.lock().get_mut(cpu.index()) {
            *slot = deadline;
        }
    }
}
