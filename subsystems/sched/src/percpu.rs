//! # Per-CPU Scheduling State

use crate::ready_queue::ReadyQueue;
use crate::timeout::Timeout;
use crate::{CpuId, Time};

/// Scheduling state owned by one CPU
#[derive(Debug)]
pub struct PerCpu {
    id: CpuId,
    online: bool,
    /// Ready queue
    pub rq: ReadyQueue,
    /// End of the active context's allotment
    pub timeslice: Timeout,
    /// A reschedule pass is pending
    pub need_resched: bool,
    in_schedule: bool,
    idle_since: Option<Time>,
    idle_total: Time,
}

impl PerCpu {
    /// Create offline state for `id`
    pub fn new(id: CpuId) -> Self {
        Self {
            id,
            online: false,
            rq: ReadyQueue::new(),
            timeslice: Timeout::new(),
            need_resched: false,
            in_schedule: false,
            idle_since: None,
            idle_total: 0,
        }
    }

    /// CPU number
    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Check whether the CPU takes part in scheduling
    pub fn is_online(&self) -> bool {
        self.online
    }

    /// Bring the CPU up; it starts out idle
    pub fn bring_up(&mut self, now: Time) {
        self.online = true;
        self.need_resched = false;
        self.idle_since = Some(now);
    }

    /// Take the CPU down
    pub fn take_down(&mut self, now: Time) {
        self.leave_idle(now);
        self.online = false;
        self.need_resched = false;
    }

    /// Enter the scheduler
    ///
    /// # Panics
    ///
    /// Panics if a scheduling pass is already running on this CPU.
    pub fn begin_schedule(&mut self) {
        assert!(!self.in_schedule, "reentrant schedule on {}", self.id);
        self.in_schedule = true;
        self.need_resched = false;
    }

    /// Leave the scheduler
    pub fn end_schedule(&mut self) {
        self.in_schedule = false;
    }

    /// Start idle accounting
    pub fn enter_idle(&mut self, now: Time) {
        if self.idle_since.is_none() {
            self.idle_since = Some(now);
        }
    }

    /// Stop idle accounting
    pub fn leave_idle(&mut self, now: Time) {
        if let Some(since) = self.idle_since.take() {
            self.idle_total += now.saturating_sub(since);
        }
    }

    /// Total idle time up to `now`
    pub fn idle_time(&self, now: Time) -> Time {
        self.idle_total + self.idle_since.map_or(0, |since| now.saturating_sub(since))
    }
}
