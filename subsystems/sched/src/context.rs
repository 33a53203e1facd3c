//! # Scheduling Contexts
//!
//! A scheduling context (Sc) binds a priority to one thread and carries the
//! ordered list of constraints that decide whether it may run. Slot order
//! matters only for which constraint is blamed when several deny running.

use crate::priority::Priority;
use crate::{ConstraintId, CpuId, SchedError, SchedResult, ThreadId};
use arrayvec::ArrayVec;
use spin::Mutex;
use static_assertions::const_assert;

/// Constraint slots per scheduling context
pub const MAX_CONSTRAINTS: usize = 4;

const_assert!(MAX_CONSTRAINTS > 0 && MAX_CONSTRAINTS <= 8);

#[derive(Debug, Default)]
struct Slots {
    list: [Option<ConstraintId>; MAX_CONSTRAINTS],
    blocked_by: Option<ConstraintId>,
}

/// Scheduling context
#[derive(Debug)]
pub struct SchedContext {
    thread: ThreadId,
    prio: Priority,
    home: Option<CpuId>,
    slots: Mutex<Slots>,
}

impl SchedContext {
    /// Create an unplaced context for `thread`
    pub fn new(thread: ThreadId, prio: Priority) -> Self {
        Self {
            thread,
            prio,
            home: None,
            slots: Mutex::new(Slots::default()),
        }
    }

    /// Bound thread
    #[inline]
    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    /// Current priority
    #[inline]
    pub fn prio(&self) -> Priority {
        self.prio
    }

    /// Change the priority (the caller requeues)
    pub fn set_prio(&mut self, prio: Priority) {
        self.prio = prio;
    }

    /// CPU the context is placed on
    #[inline]
    pub fn home(&self) -> Option<CpuId> {
        self.home
    }

    /// Place the context on a CPU
    pub fn set_home(&mut self, cpu: CpuId) {
        self.home = Some(cpu);
    }

    /// Attach a constraint to the first free slot
    ///
    /// Fails with `InvalidState` if already attached and with `OutOfMemory`
    /// if every slot is taken.
    pub fn attach(&self, constraint: ConstraintId) -> SchedResult<()> {
        let mut slots = self.slots.lock();
        if slots.list.contains(&Some(constraint)) {
            return Err(SchedError::InvalidState);
        }
        let free = slots
            .list
            .iter_mut()
            .find(|slot| slot.is_none())
            .ok_or(SchedError::OutOfMemory)?;
        *free = Some(constraint);
        Ok(())
    }

    /// Detach a constraint
    ///
    /// Returns whether the context was blocked by it; the blocked marker is
    /// cleared in that case.
    pub fn detach(&self, constraint: ConstraintId) -> SchedResult<bool> {
        let mut slots = self.slots.lock();
        let slot = slots
            .list
            .iter_mut()
            .find(|slot| **slot == Some(constraint))
            .ok_or(SchedError::NotFound)?;
        *slot = None;

        if slots.blocked_by == Some(constraint) {
            slots.blocked_by = None;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Check whether a constraint is attached
    pub fn contains(&self, constraint: ConstraintId) -> bool {
        self.slots.lock().list.contains(&Some(constraint))
    }

    /// Check whether at least one constraint is attached
    pub fn is_constrained(&self) -> bool {
        self.slots.lock().list.iter().any(Option::is_some)
    }

    /// Attached constraints in slot order
    pub fn constraints(&self) -> ArrayVec<ConstraintId, MAX_CONSTRAINTS> {
        self.slots.lock().list.iter().flatten().copied().collect()
    }

    /// Constraint this context is blocked on
    pub fn blocked_by(&self) -> Option<ConstraintId> {
        self.slots.lock().blocked_by
    }

    /// Record the blocking constraint
    pub fn set_blocked(&self, constraint: ConstraintId) {
        self.slots.lock().blocked_by = Some(constraint);
    }

    /// Clear the blocked marker if it names `constraint`
    pub fn clear_blocked(&self, constraint: ConstraintId) -> bool {
        let mut slots = self.slots.lock();
        if slots.blocked_by == Some(constraint) {
            slots.blocked_by = None;
            true
        } else {
            false
        }
    }
}
