//! # Timeouts
//!
//! Per-CPU ordered timer queues. Each timer has exactly one owner: the
//! CPU's timeslice timeout or a scheduling constraint. The hardware one-shot
//! timer of a CPU is always programmed with the earliest deadline of that
//! CPU's queue.

use crate::{ConstraintId, CpuId, Time, TimeDelta};
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use tempo_hal::{time_diff, CpuMask};

/// Receiver of a timer expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOwner {
    /// End of the active context's timeslice
    Timeslice,
    /// Timer owned by a scheduling constraint
    Constraint(ConstraintId),
}

impl TimerOwner {
    /// Dispatch class; lower classes fire first at equal deadlines
    const fn class(self) -> u8 {
        match self {
            TimerOwner::Timeslice => 0,
            TimerOwner::Constraint(_) => 1,
        }
    }
}

/// Position of a timer in a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimerKey {
    deadline: Time,
    class: u8,
    seq: u64,
}

impl TimerKey {
    /// Absolute expiry time
    pub const fn deadline(&self) -> Time {
        self.deadline
    }
}

/// Handle of one (possibly disarmed) timer
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    armed: Option<(CpuId, TimerKey)>,
}

impl Timeout {
    /// Create a disarmed timeout
    pub const fn new() -> Self {
        Self { armed: None }
    }

    /// Check whether the timeout is armed
    #[inline]
    pub const fn is_set(&self) -> bool {
        self.armed.is_some()
    }

    /// Deadline of the armed timeout
    pub fn deadline(&self) -> Option<Time> {
        self.armed.map(|(_, key)| key.deadline)
    }

    /// CPU whose queue holds the armed timeout
    pub fn cpu(&self) -> Option<CpuId> {
        self.armed.map(|(cpu, _)| cpu)
    }

    /// Signed time left until expiry
    pub fn get_remaining(&self, now: Time) -> Option<TimeDelta> {
        self.deadline().map(|deadline| time_diff(deadline, now))
    }

    /// Mark the timeout as fired after its queue entry was consumed
    pub fn expire(&mut self) {
        self.armed = None;
    }
}

/// Timer queues of all CPUs
#[derive(Debug)]
pub struct Timers {
    queues: Vec<BTreeMap<TimerKey, TimerOwner>>,
    seq: u64,
    dirty: CpuMask,
}

impl Timers {
    /// Create empty queues for `cpus` CPUs
    pub fn new(cpus: usize) -> Self {
        Self {
            queues: (0..cpus).map(|_| BTreeMap::new()).collect(),
            seq: 0,
            dirty: CpuMask::EMPTY,
        }
    }

    /// Arm `timeout` on `cpu`
    ///
    /// # Panics
    ///
    /// Panics if the timeout is already armed.
    pub fn set(&mut self, timeout: &mut Timeout, cpu: CpuId, deadline: Time, owner: TimerOwner) {
        assert!(
            !timeout.is_set(),
            "timeout for {:?} armed twice (pending at {:?})",
            owner,
            timeout.deadline()
        );
        let key = TimerKey {
            deadline,
            class: owner.class(),
            seq: self.seq,
        };
        self.seq += 1;
        self.queues[cpu.index()].insert(key, owner);
        self.dirty.set(cpu);
        timeout.armed = Some((cpu, key));
        log::trace!("[sched] {:?} armed on {} at {}", owner, cpu, deadline);
    }

    /// Disarm `timeout`; harmless if it is not armed
    pub fn reset(&mut self, timeout: &mut Timeout) {
        if let Some((cpu, key)) = timeout.armed.take() {
            if let Some(queue) = self.queues.get_mut(cpu.index()) {
                queue.remove(&key);
            }
            self.dirty.set(cpu);
        }
    }

    /// Earliest deadline queued on `cpu`
    pub fn next_deadline(&self, cpu: CpuId) -> Option<Time> {
        self.queues
            .get(cpu.index())
            .and_then(|queue| queue.keys().next())
            .map(TimerKey::deadline)
    }

    /// Remove and return the next timer of `cpu` due at `now`
    pub fn pop_expired(&mut self, cpu: CpuId, now: Time) -> Option<TimerOwner> {
        let queue = self.queues.get_mut(cpu.index())?;
        let (&key, _) = queue.iter().next()?;
        if key.deadline > now {
            return None;
        }
        self.dirty.set(cpu);
        queue.remove(&key)
    }

    /// Number of timers queued on `cpu`
    pub fn pending(&self, cpu: CpuId) -> usize {
        self.queues.get(cpu.index()).map_or(0, BTreeMap::len)
    }

    /// CPUs whose earliest deadline may have changed since the last call
    pub fn take_dirty(&mut self) -> CpuMask {
        core::mem::take(&mut self.dirty)
    }
}
