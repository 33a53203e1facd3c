//! # Scheduler
//!
//! The scheduler object owns every piece of scheduling state: the per-CPU
//! ready queues and timeslice timeouts, the timer queues, the tables of
//! scheduling contexts and constraints, and the thread table.
//!
//! - [`dispatch`]: selecting and switching the running context, timer
//!   expiry, constraint effects
//! - [`ops`]: object management and the privileged operations

mod dispatch;
mod ops;

pub use ops::{ConstraintInfo, RunParams};

use crate::config::SchedConfig;
use crate::constraint::{Constraint, ConstraintKind, Effects, Env};
use crate::context::SchedContext;
use crate::hotplug::IrqChip;
use crate::metrics::SchedulerMetrics;
use crate::object::ObjectTable;
use crate::percpu::PerCpu;
use crate::ready_queue::ReadyQueue;
use crate::thread::ThreadEntry;
use crate::timeout::Timers;
use crate::{ConstraintId, CpuId, SchedError, SchedResult, ScId, ThreadId, Time};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use tempo_hal::perf::{Counter, PerfCounters, PerfEvent};
use tempo_hal::{Clock, CpuMask};

/// Scheduler statistics snapshot
#[derive(Debug, Clone)]
pub struct SchedulerStats {
    /// Live scheduling contexts
    pub contexts: usize,
    /// Live constraints
    pub constraints: usize,
    /// Contexts sitting in a ready queue
    pub queued: usize,
    /// Contexts blocked on a constraint
    pub blocked: usize,
    /// Per-CPU figures
    pub cpus: Vec<CpuStats>,
}

/// Per-CPU statistics
#[derive(Debug, Clone)]
pub struct CpuStats {
    /// CPU number
    pub cpu: CpuId,
    /// Online state
    pub online: bool,
    /// Queued contexts
    pub queued: usize,
    /// Running context
    pub active: Option<ScId>,
    /// Accumulated idle time
    pub idle_time: Time,
}

/// The scheduling subsystem
pub struct Scheduler {
    config: SchedConfig,
    clock: Arc<dyn Clock>,
    perf: Arc<dyn PerfCounters>,
    cpus: Vec<PerCpu>,
    timers: Timers,
    contexts: ObjectTable<ScId, SchedContext>,
    constraints: ObjectTable<ConstraintId, Constraint>,
    threads: BTreeMap<ThreadId, ThreadEntry>,
    global: Option<ConstraintId>,
    icu: IrqChip,
    metrics: SchedulerMetrics,
}

impl Scheduler {
    /// Create a scheduler; all CPUs start offline
    pub fn new(
        config: SchedConfig,
        clock: Arc<dyn Clock>,
        perf: Arc<dyn PerfCounters>,
    ) -> SchedResult<Self> {
        config.validate()?;
        crate::factory::init();
        log::info!(
            "[sched] initializing: {} cpus, default slice {}us",
            config.max_cpus,
            config.default_time_slice
        );
        Ok(Self {
            cpus: (0..config.max_cpus as u32)
                .map(|id| PerCpu::new(CpuId::new(id)))
                .collect(),
            timers: Timers::new(config.max_cpus),
            contexts: ObjectTable::new(config.max_contexts),
            constraints: ObjectTable::new(config.max_constraints),
            threads: BTreeMap::new(),
            global: None,
            icu: IrqChip::new(),
            metrics: SchedulerMetrics::new(),
            config,
            clock,
            perf,
        })
    }

    /// Bring a CPU online
    pub fn cpu_up(&mut self, cpu: CpuId) -> SchedResult<()> {
        let now = self.clock.now();
        let percpu = self.cpus.get_mut(cpu.index()).ok_or(SchedError::OutOfRange)?;
        if percpu.is_online() {
            return Err(SchedError::InvalidState);
        }
        percpu.bring_up(now);
        for counter in Counter::ALL {
            self.perf.setup(cpu, counter, PerfEvent::for_counter(counter));
        }
        log::info!("[sched] {} online", cpu);
        self.trigger_hotplug_event();
        Ok(())
    }

    /// Take a CPU offline; its queue must be empty and nothing may run
    pub fn cpu_down(&mut self, cpu: CpuId) -> SchedResult<()> {
        let now = self.clock.now();
        let percpu = self.cpus.get_mut(cpu.index()).ok_or(SchedError::OutOfRange)?;
        if !percpu.is_online() || !percpu.rq.is_empty() || percpu.rq.active().is_some() {
            return Err(SchedError::InvalidState);
        }
        self.timers.reset(&mut percpu.timeslice);
        percpu.take_down(now);
        log::info!("[sched] {} offline", cpu);
        self.sync_timers();
        self.trigger_hotplug_event();
        Ok(())
    }

    /// Configuration in use
    pub fn config(&self) -> &SchedConfig {
        &self.config
    }

    /// Activity counters
    pub fn metrics(&self) -> &SchedulerMetrics {
        &self.metrics
    }

    /// Current time of the system clock
    pub fn now(&self) -> Time {
        self.clock.now()
    }

    /// CPUs currently online
    pub fn online_mask(&self) -> CpuMask {
        let mut mask = CpuMask::EMPTY;
        for percpu in self.cpus.iter().filter(|percpu| percpu.is_online()) {
            mask.set(percpu.id());
        }
        mask
    }

    /// Check whether a CPU is online
    pub fn is_online(&self, cpu: CpuId) -> bool {
        self.cpus.get(cpu.index()).is_some_and(PerCpu::is_online)
    }

    /// Ready queue of a CPU
    pub fn ready_queue(&self, cpu: CpuId) -> Option<&ReadyQueue> {
        self.cpus.get(cpu.index()).map(|percpu| &percpu.rq)
    }

    /// Scheduling context running on a CPU
    pub fn current_sc(&self, cpu: CpuId) -> Option<ScId> {
        self.cpus.get(cpu.index()).and_then(|percpu| percpu.rq.active())
    }

    /// Thread running on a CPU
    pub fn current(&self, cpu: CpuId) -> Option<ThreadId> {
        self.current_sc(cpu)
            .and_then(|sc| self.contexts.get(sc))
            .map(SchedContext::thread)
    }

    /// Check whether a CPU has a reschedule pending
    pub fn needs_reschedule(&self, cpu: CpuId) -> bool {
        self.cpus.get(cpu.index()).is_some_and(|percpu| percpu.need_resched)
    }

    /// Idle time accumulated by a CPU
    pub fn idle_time(&self, cpu: CpuId) -> SchedResult<Time> {
        let percpu = self.cpus.get(cpu.index()).ok_or(SchedError::OutOfRange)?;
        Ok(percpu.idle_time(self.clock.now()))
    }

    /// Scheduling context of a thread
    pub fn context_of(&self, thread: ThreadId) -> Option<ScId> {
        self.threads.get(&thread).map(ThreadEntry::sc)
    }

    /// Look up a scheduling context
    pub fn context(&self, sc: ScId) -> Option<&SchedContext> {
        self.contexts.get(sc)
    }

    /// Look up a constraint
    pub fn constraint(&self, id: ConstraintId) -> Option<&Constraint> {
        self.constraints.get(id)
    }

    /// Constraint attached on every run-thread
    pub fn global_constraint(&self) -> Option<ConstraintId> {
        self.global
    }

    /// Hotplug interrupt controller
    pub fn icu(&self) -> &IrqChip {
        &self.icu
    }

    /// Hotplug interrupt controller, mutably
    pub fn icu_mut(&mut self) -> &mut IrqChip {
        &mut self.icu
    }

    /// Snapshot of the scheduler state
    pub fn stats(&self) -> SchedulerStats {
        let now = self.clock.now();
        let cpus: Vec<_> = self
            .cpus
            .iter()
            .map(|percpu| CpuStats {
                cpu: percpu.id(),
                online: percpu.is_online(),
                queued: percpu.rq.len(),
                active: percpu.rq.active(),
                idle_time: percpu.idle_time(now),
            })
            .collect();
        SchedulerStats {
            contexts: self.contexts.len(),
            constraints: self.constraints.len(),
            queued: cpus.iter().map(|stats| stats.queued).sum(),
            blocked: self
                .contexts
                .iter()
                .filter(|(_, ctx)| ctx.blocked_by().is_some())
                .count(),
            cpus,
        }
    }

    fn is_thread_ready(&self, thread: ThreadId) -> bool {
        self.threads.get(&thread).is_some_and(ThreadEntry::is_ready)
    }

    fn sc_of(&self, thread: ThreadId) -> SchedResult<ScId> {
        self.context_of(thread).ok_or(SchedError::NotFound)
    }

    /// Run one constraint hook and carry out its effects
    fn run_hook<F>(&mut self, id: ConstraintId, cpu: CpuId, f: F) -> Effects
    where
        F: FnOnce(&mut ConstraintKind, &mut Env<'_>) -> Effects,
    {
        let now = self.clock.now();
        let Some(constraint) = self.constraints.get_mut(id) else {
            return Effects::empty();
        };
        let effects = constraint.hook(id, cpu, now, &mut self.timers, f);
        self.apply_effects(id, cpu, effects);
        effects
    }

    /// Run a hook on every constraint of `sc`, in slot order
    fn fan_out<F>(&mut self, sc: ScId, cpu: CpuId, f: F)
    where
        F: Fn(&mut ConstraintKind, &mut Env<'_>) -> Effects,
    {
        let Some(ids) = self.contexts.get(sc).map(SchedContext::constraints) else {
            return;
        };
        for id in ids {
            self.run_hook(id, cpu, &f);
        }
    }

    /// CPUs whose running context uses constraint `id`
    fn cpus_running(&self, id: ConstraintId) -> CpuMask {
        let mut mask = CpuMask::EMPTY;
        for percpu in &self.cpus {
            let uses = percpu
                .rq
                .active()
                .and_then(|sc| self.contexts.get(sc))
                .is_some_and(|ctx| ctx.contains(id));
            if uses {
                mask.set(percpu.id());
            }
        }
        mask
    }

    /// Push changed earliest deadlines to the hardware timers
    fn sync_timers(&mut self) {
        for cpu in self.timers.take_dirty().iter() {
            self.clock.program(cpu, self.timers.next_deadline(cpu));
        }
    }

    /// Load the budgets of a bandwidth constraint into `cpu`'s counters
    fn program_counters(&self, cpu: CpuId, id: ConstraintId) {
        let kind = self.constraints.get(id).map(Constraint::kind);
        if let Some(ConstraintKind::Bandwidth(bw)) = kind {
            for counter in Counter::ALL {
                self.perf.write(cpu, counter, bw.budget(counter));
            }
        }
    }

    /// Check the cross-structure invariants
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let mut seen = alloc::collections::BTreeSet::new();
        for percpu in &self.cpus {
            percpu.rq.assert_consistent();
            for sc in percpu.rq.iter() {
                assert!(seen.insert(sc), "{} queued on two CPUs", sc);
                let ctx = &self.contexts.get(sc).expect("queued context exists");
                assert_eq!(ctx.home(), Some(percpu.id()), "{} queued away from home", sc);
                assert!(ctx.blocked_by().is_none(), "{} queued while blocked", sc);
            }
        }
        for (sc, ctx) in self.contexts.iter() {
            if let Some(id) = ctx.blocked_by() {
                let constraint = self.constraints.get(id).expect("blocking constraint exists");
                assert!(constraint.blocked().any(|entry| entry == sc));
                assert!(ctx.contains(id));
            }
        }
        for (id, constraint) in self.constraints.iter() {
            for sc in constraint.blocked() {
                let ctx = self.contexts.get(sc).expect("blocked context exists");
                assert_eq!(ctx.blocked_by(), Some(id));
            }
        }
    }
}

impl core::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Scheduler")
            .field("cpus", &self.cpus.len())
            .field("online", &self.online_mask())
            .field("contexts", &self.contexts.len())
            .field("constraints", &self.constraints.len())
            .field("global", &self.global)
            .finish()
    }
}
