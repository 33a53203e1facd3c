//! # Scheduled Threads
//!
//! The scheduler's view of an execution context: readiness and the
//! scheduling context bound to it.

use crate::priority::Priority;
use crate::{CpuId, ScId, ThreadId, Time};
use bitflags::bitflags;

bitflags! {
    /// Thread state bits relevant to scheduling
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ThreadState: u32 {
        /// May be selected to run
        const READY = 1 << 0;
        /// Being torn down
        const DEAD = 1 << 1;
    }
}

/// Placement handed to a thread when it moves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Target CPU
    pub cpu: CpuId,
    /// Priority on the target CPU
    pub prio: Priority,
    /// Requested time slice
    pub quantum: Time,
}

/// Thread table entry
#[derive(Debug, Clone)]
pub struct ThreadEntry {
    id: ThreadId,
    sc: ScId,
    state: ThreadState,
}

impl ThreadEntry {
    /// Create a ready thread bound to `sc`
    pub fn new(id: ThreadId, sc: ScId) -> Self {
        Self {
            id,
            sc,
            state: ThreadState::READY,
        }
    }

    /// Thread ID
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Bound scheduling context
    pub fn sc(&self) -> ScId {
        self.sc
    }

    /// State bits
    pub fn state(&self) -> ThreadState {
        self.state
    }

    /// Check readiness
    pub fn is_ready(&self) -> bool {
        self.state.contains(ThreadState::READY) && !self.state.contains(ThreadState::DEAD)
    }

    /// Set or clear the ready bit
    pub fn set_ready(&mut self, ready: bool) {
        self.state.set(ThreadState::READY, ready);
    }

    /// Mark as being torn down
    pub fn kill(&mut self) {
        self.state.insert(ThreadState::DEAD);
        self.state.remove(ThreadState::READY);
    }
}
