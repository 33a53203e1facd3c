//! # Scheduling Constraints
//!
//! A constraint is one admission or timing rule layered on top of priority
//! scheduling. Every constraint carries a run flag and a FIFO list of the
//! scheduling contexts currently blocked on it; the variants add their own
//! timers and bookkeeping.
//!
//! Variants never touch the ready queues themselves. Their hooks receive an
//! [`Env`] (who, where, when, plus the timer queues) and report what must
//! happen next as [`Effects`], which the scheduler carries out.

pub mod bandwidth;
pub mod budget;
pub mod gate;
pub mod quantum;
pub mod window;

pub use bandwidth::Bandwidth;
pub use budget::Budget;
pub use gate::Gate;
pub use quantum::Quantum;
pub use window::TimeWindow;

use crate::config::SchedConfig;
use crate::invoke::Mword;
use crate::timeout::{TimerOwner, Timers, Timeout};
use crate::{ConstraintId, CpuId, SchedError, SchedResult, ScId, Time, TimeDelta};
use alloc::collections::VecDeque;
use bitflags::bitflags;
use core::fmt;

/// Type tag of a constraint, as carried in creation messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConstraintType {
    /// Run flag toggled explicitly
    Gate = 0,
    /// Round-robin quantum
    Quantum = 1,
    /// Periodic budget with replenishment
    Budget = 2,
    /// Admission inside a time window
    TimeWindow = 3,
    /// Memory-bandwidth throttle
    Bandwidth = 4,
}

impl ConstraintType {
    /// All known types, by tag
    pub const ALL: [ConstraintType; 5] = [
        ConstraintType::Gate,
        ConstraintType::Quantum,
        ConstraintType::Budget,
        ConstraintType::TimeWindow,
        ConstraintType::Bandwidth,
    ];

    /// Numeric tag
    #[inline]
    pub const fn tag(self) -> u8 {
        self as u8
    }

    /// Human-readable name
    pub const fn name(self) -> &'static str {
        match self {
            ConstraintType::Gate => "gate",
            ConstraintType::Quantum => "quantum",
            ConstraintType::Budget => "budget",
            ConstraintType::TimeWindow => "time-window",
            ConstraintType::Bandwidth => "bandwidth",
        }
    }
}

impl TryFrom<Mword> for ConstraintType {
    type Error = SchedError;

    fn try_from(tag: Mword) -> SchedResult<Self> {
        Self::ALL
            .into_iter()
            .find(|ty| Mword::from(ty.tag()) == tag)
            .ok_or(SchedError::InvalidArgument)
    }
}

impl fmt::Display for ConstraintType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Creation parameters of a constraint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintParams {
    /// Gate with its initial run flag
    Gate {
        /// Initial run flag
        run: bool,
    },
    /// Round-robin quantum
    Quantum {
        /// Time slice length
        quantum: Time,
    },
    /// Periodic budget
    Budget {
        /// Run time granted per period
        budget: Time,
        /// Replenishment period
        period: Time,
    },
    /// Time window
    TimeWindow {
        /// Absolute window start
        start: Time,
        /// Window length
        duration: Time,
        /// Repetition period (single pulse when `None`)
        period: Option<Time>,
    },
    /// Memory-bandwidth throttle
    Bandwidth {
        /// Read budget in MB/s
        read_mbs: u64,
        /// Write budget in MB/s
        write_mbs: u64,
        /// Measurement period (configuration default when `None`)
        period: Option<Time>,
    },
}

impl ConstraintParams {
    /// Type tag of the described constraint
    pub const fn kind(&self) -> ConstraintType {
        match self {
            ConstraintParams::Gate { .. } => ConstraintType::Gate,
            ConstraintParams::Quantum { .. } => ConstraintType::Quantum,
            ConstraintParams::Budget { .. } => ConstraintType::Budget,
            ConstraintParams::TimeWindow { .. } => ConstraintType::TimeWindow,
            ConstraintParams::Bandwidth { .. } => ConstraintType::Bandwidth,
        }
    }

    /// Range-check the parameters
    pub fn validate(&self) -> SchedResult<()> {
        let ok = match *self {
            ConstraintParams::Gate { .. } => true,
            ConstraintParams::Quantum { quantum } => quantum > 0,
            ConstraintParams::Budget { budget, period } => budget > 0 && budget <= period,
            ConstraintParams::TimeWindow {
                start,
                duration,
                period,
            } => {
                duration > 0
                    && start.checked_add(duration).is_some()
                    && period.map_or(true, |period| period >= duration)
            }
            ConstraintParams::Bandwidth { period, .. } => period.map_or(true, |p| p > 0),
        };
        if ok {
            Ok(())
        } else {
            Err(SchedError::InvalidArgument)
        }
    }
}

bitflags! {
    /// Follow-up actions requested by a constraint hook
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Effects: u16 {
        /// Set the run flag
        const SET_RUN = 1 << 0;
        /// Clear the run flag
        const CLEAR_RUN = 1 << 1;
        /// Release every blocked context
        const RELEASE = 1 << 2;
        /// Re-evaluate the running context
        const RESCHEDULE = 1 << 3;
        /// Rotate the running context behind its bucket peers
        const ROTATE = 1 << 4;
        /// Recompute the timeslice of CPUs running a user of this constraint
        const REARM_TIMESLICE = 1 << 5;
        /// Load the bandwidth budgets into the performance counters
        const PROGRAM_COUNTERS = 1 << 6;
        /// A budget was overrun
        const OVERRUN = 1 << 7;
        /// A budget was exhausted
        const EXHAUSTED = 1 << 8;
        /// A budget was replenished
        const REPLENISHED = 1 << 9;
        /// A bandwidth limit was hit
        const THROTTLED = 1 << 10;
    }
}

/// Context handed to constraint hooks
pub struct Env<'a> {
    /// Handle of the constraint
    pub id: ConstraintId,
    /// CPU the hook runs for
    pub cpu: CpuId,
    /// Current time
    pub now: Time,
    /// Current run flag
    pub run: bool,
    /// Timer queues
    pub timers: &'a mut Timers,
}

impl Env<'_> {
    /// Arm a constraint timer on this CPU
    pub fn arm(&mut self, timeout: &mut Timeout, deadline: Time) {
        self.timers
            .set(timeout, self.cpu, deadline, TimerOwner::Constraint(self.id));
    }

    /// Arm a constraint timer on this CPU, moving it if already armed
    pub fn rearm(&mut self, timeout: &mut Timeout, deadline: Time) {
        self.timers.reset(timeout);
        self.arm(timeout, deadline);
    }

    /// Disarm a timer if it is registered on this CPU
    pub fn disarm_local(&mut self, timeout: &mut Timeout) {
        if timeout.cpu() == Some(self.cpu) {
            self.timers.reset(timeout);
        }
    }
}

/// Per-variant behaviour
///
/// All hooks default to doing nothing.
pub trait ConstraintHooks {
    /// A user of the constraint starts running on `env.cpu`
    fn activate(&mut self, _env: &mut Env<'_>) -> Effects {
        Effects::empty()
    }

    /// A user of the constraint stops running on `env.cpu`
    fn deactivate(&mut self, _env: &mut Env<'_>) -> Effects {
        Effects::empty()
    }

    /// A user leaves `env.cpu`
    fn migrate_away(&mut self, _env: &mut Env<'_>) -> Effects {
        Effects::empty()
    }

    /// A user arrives on `env.cpu`
    fn migrate_to(&mut self, _env: &mut Env<'_>) -> Effects {
        Effects::empty()
    }

    /// Logical end of the running user's allotment on `cpu`
    fn exhaustion(&self, _cpu: CpuId) -> Option<Time> {
        None
    }

    /// The timeslice timeout passed [`ConstraintHooks::exhaustion`]
    fn timeslice_expired(&mut self, _env: &mut Env<'_>) -> Effects {
        Effects::empty()
    }

    /// The constraint's own timer fired
    fn timer_expired(&mut self, _env: &mut Env<'_>) -> Effects {
        Effects::empty()
    }

    /// A performance counter overflowed while a user was running
    fn counter_overflow(&mut self, _env: &mut Env<'_>) -> Effects {
        Effects::empty()
    }

    /// Remaining run time or budget, for diagnostics
    fn remaining(&self, _now: Time) -> Option<TimeDelta> {
        None
    }

    /// Disarm all timers before destruction
    fn teardown(&mut self, _timers: &mut Timers) {}
}

/// Closed set of constraint variants
#[derive(Debug)]
pub enum ConstraintKind {
    /// See [`Gate`]
    Gate(Gate),
    /// See [`Quantum`]
    Quantum(Quantum),
    /// See [`Budget`]
    Budget(Budget),
    /// See [`TimeWindow`]
    TimeWindow(TimeWindow),
    /// See [`Bandwidth`]
    Bandwidth(Bandwidth),
}

macro_rules! dispatch {
    ($self:expr, $inner:ident => $body:expr) => {
        match $self {
            ConstraintKind::Gate($inner) => $body,
            ConstraintKind::Quantum($inner) => $body,
            ConstraintKind::Budget($inner) => $body,
            ConstraintKind::TimeWindow($inner) => $body,
            ConstraintKind::Bandwidth($inner) => $body,
        }
    };
}

impl ConstraintHooks for ConstraintKind {
    fn activate(&mut self, env: &mut Env<'_>) -> Effects {
        dispatch!(self, c => c.activate(env))
    }

    fn deactivate(&mut self, env: &mut Env<'_>) -> Effects {
        dispatch!(self, c => c.deactivate(env))
    }

    fn migrate_away(&mut self, env: &mut Env<'_>) -> Effects {
        dispatch!(self, c => c.migrate_away(env))
    }

    fn migrate_to(&mut self, env: &mut Env<'_>) -> Effects {
        dispatch!(self, c => c.migrate_to(env))
    }

    fn exhaustion(&self, cpu: CpuId) -> Option<Time> {
        dispatch!(self, c => c.exhaustion(cpu))
    }

    fn timeslice_expired(&mut self, env: &mut Env<'_>) -> Effects {
        dispatch!(self, c => c.timeslice_expired(env))
    }

    fn timer_expired(&mut self, env: &mut Env<'_>) -> Effects {
        dispatch!(self, c => c.timer_expired(env))
    }

    fn counter_overflow(&mut self, env: &mut Env<'_>) -> Effects {
        dispatch!(self, c => c.counter_overflow(env))
    }

    fn remaining(&self, now: Time) -> Option<TimeDelta> {
        dispatch!(self, c => c.remaining(now))
    }

    fn teardown(&mut self, timers: &mut Timers) {
        dispatch!(self, c => c.teardown(timers))
    }
}

/// A scheduling constraint
#[derive(Debug)]
pub struct Constraint {
    kind: ConstraintKind,
    run: bool,
    blocked: VecDeque<ScId>,
}

impl Constraint {
    /// Build a constraint from validated parameters
    pub fn new(params: ConstraintParams, config: &SchedConfig) -> Self {
        let (kind, run) = match params {
            ConstraintParams::Gate { run } => (ConstraintKind::Gate(Gate::new()), run),
            ConstraintParams::Quantum { quantum } => {
                (ConstraintKind::Quantum(Quantum::new(quantum)), true)
            }
            ConstraintParams::Budget { budget, period } => {
                (ConstraintKind::Budget(Budget::new(budget, period)), true)
            }
            ConstraintParams::TimeWindow {
                start,
                duration,
                period,
            } => (
                ConstraintKind::TimeWindow(TimeWindow::new(start, duration, period)),
                false,
            ),
            ConstraintParams::Bandwidth {
                read_mbs,
                write_mbs,
                period,
            } => (
                ConstraintKind::Bandwidth(Bandwidth::new(
                    read_mbs,
                    write_mbs,
                    period.unwrap_or(config.bandwidth_period),
                )),
                true,
            ),
        };
        Self {
            kind,
            run,
            blocked: VecDeque::new(),
        }
    }

    /// Variant state
    pub fn kind(&self) -> &ConstraintKind {
        &self.kind
    }

    /// Variant state, mutably
    pub fn kind_mut(&mut self) -> &mut ConstraintKind {
        &mut self.kind
    }

    /// Type tag
    pub fn constraint_type(&self) -> ConstraintType {
        match self.kind {
            ConstraintKind::Gate(_) => ConstraintType::Gate,
            ConstraintKind::Quantum(_) => ConstraintType::Quantum,
            ConstraintKind::Budget(_) => ConstraintType::Budget,
            ConstraintKind::TimeWindow(_) => ConstraintType::TimeWindow,
            ConstraintKind::Bandwidth(_) => ConstraintType::Bandwidth,
        }
    }

    /// Run predicate; does not register anything
    #[inline]
    pub fn can_run(&self) -> bool {
        self.run
    }

    /// Set the run flag directly
    pub fn set_run(&mut self, run: bool) {
        self.run = run;
    }

    /// Record `sc` as blocked on this constraint
    ///
    /// # Panics
    ///
    /// Panics if `sc` is already on the blocked list.
    pub fn block(&mut self, sc: ScId) {
        assert!(
            !self.blocked.contains(&sc),
            "{} blocked twice on the same constraint",
            sc
        );
        debug_assert!(!self.run, "blocking {} on a runnable constraint", sc);
        self.blocked.push_back(sc);
    }

    /// Remove `sc` from the blocked list
    pub fn unblock(&mut self, sc: ScId) -> bool {
        match self.blocked.iter().position(|&entry| entry == sc) {
            Some(pos) => {
                self.blocked.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Empty the blocked list, oldest first
    pub fn take_blocked(&mut self) -> VecDeque<ScId> {
        core::mem::take(&mut self.blocked)
    }

    /// Contexts blocked on this constraint, oldest first
    pub fn blocked(&self) -> impl Iterator<Item = ScId> + '_ {
        self.blocked.iter().copied()
    }

    /// Number of blocked contexts
    pub fn blocked_len(&self) -> usize {
        self.blocked.len()
    }

    /// Apply the run-flag part of hook effects
    pub fn apply(&mut self, effects: Effects) {
        if effects.contains(Effects::CLEAR_RUN) {
            self.run = false;
        }
        if effects.contains(Effects::SET_RUN) {
            self.run = true;
        }
    }

    /// Run a hook against the variant with an [`Env`] for this constraint
    pub fn hook<F>(
        &mut self,
        id: ConstraintId,
        cpu: CpuId,
        now: Time,
        timers: &mut Timers,
        f: F,
    ) -> Effects
    where
        F: FnOnce(&mut ConstraintKind, &mut Env<'_>) -> Effects,
    {
        let mut env = Env {
            id,
            cpu,
            now,
            run: self.run,
            timers,
        };
        let effects = f(&mut self.kind, &mut env);
        self.apply(effects);
        effects
    }
}

/// Read word `index` of a creation message
pub(crate) fn word(words: &[Mword], index: usize) -> SchedResult<Mword> {
    words.get(index).copied().ok_or(SchedError::InvalidArgument)
}
