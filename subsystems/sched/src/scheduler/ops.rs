//! Object management and the privileged scheduler operations.

use super::Scheduler;
use crate::constraint::{
    Constraint, ConstraintHooks, ConstraintKind, ConstraintParams, ConstraintType, Effects,
};
use crate::context::SchedContext;
use crate::object::Lifecycle;
use crate::priority::Priority;
use crate::ready_queue::Position;
use crate::thread::{MigrationInfo, ThreadEntry, ThreadState};
use crate::{ConstraintId, CpuId, CpuSet, SchedError, SchedResult, ScId, ThreadId, Time, TimeDelta};

/// Scheduling parameters of a run-thread request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParams {
    /// Priority to run at
    pub prio: Priority,
    /// Time slice for a baseline quantum constraint (0 means default)
    pub quantum: Time,
    /// CPUs the thread may be placed on
    pub cpus: CpuSet,
}

impl RunParams {
    /// Run at `prio` anywhere, with the default time slice
    pub const fn new(prio: Priority) -> Self {
        Self {
            prio,
            quantum: 0,
            cpus: CpuSet::all(),
        }
    }

    /// Restrict placement to `cpus`
    pub fn on(mut self, cpus: CpuSet) -> Self {
        self.cpus = cpus;
        self
    }
}

/// State of a constraint as reported by its `Info` invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstraintInfo {
    /// Type tag
    pub ty: ConstraintType,
    /// Run flag
    pub run: bool,
    /// Reference count (user handle plus attachments)
    pub refs: usize,
    /// Number of blocked contexts
    pub blocked: usize,
    /// Remaining run time or budget, where the variant tracks one
    pub remaining: Option<TimeDelta>,
    /// The user handle was released
    pub dying: bool,
}

impl Scheduler {
    // =========================================================================
    // Scheduling contexts
    // =========================================================================

    /// Create the scheduling context of `thread`
    ///
    /// The context starts unplaced and without constraints.
    pub fn create_context(&mut self, thread: ThreadId, prio: Priority) -> SchedResult<ScId> {
        if self.threads.contains_key(&thread) {
            return Err(SchedError::InvalidState);
        }
        let sc = self.contexts.insert(SchedContext::new(thread, prio))?;
        self.threads.insert(thread, ThreadEntry::new(thread, sc));
        log::debug!("[sched] {} created for {:?} at {}", sc, thread, prio);
        Ok(sc)
    }

    /// Tear down `thread` and its scheduling context
    ///
    /// The context leaves every queue and blocked list and drops its
    /// constraint references.
    pub fn destroy_thread(&mut self, thread: ThreadId) -> SchedResult<()> {
        let sc = self.sc_of(thread)?;
        if let Some(entry) = self.threads.get_mut(&thread) {
            entry.kill();
        }

        let home = self.contexts.get(sc).and_then(SchedContext::home);
        if let Some(cpu) = home {
            let i = cpu.index();
            if self.cpus[i].rq.active() == Some(sc) {
                self.deactivate(cpu, sc);
                self.cpus[i].need_resched = true;
            }
            self.cpus[i].rq.dequeue(sc);
        }

        let (ids, blocker) = match self.contexts.get(sc) {
            Some(ctx) => (ctx.constraints(), ctx.blocked_by()),
            None => return Err(SchedError::NotFound),
        };
        if let Some(blocker) = blocker {
            if let Some(constraint) = self.constraints.get_mut(blocker) {
                constraint.unblock(sc);
            }
        }
        for id in ids {
            if let Some(ctx) = self.contexts.get(sc) {
                ctx.detach(id)?;
            }
            self.put_constraint(id);
        }

        self.contexts.remove(sc);
        self.threads.remove(&thread);
        log::debug!("[sched] {} destroyed", sc);
        self.sync_timers();
        Ok(())
    }

    // =========================================================================
    // Constraints
    // =========================================================================

    /// Create a constraint; the caller holds the only reference
    pub fn create_constraint(&mut self, params: ConstraintParams) -> SchedResult<ConstraintId> {
        params.validate()?;
        let id = self
            .constraints
            .insert(Constraint::new(params, &self.config))?;
        log::debug!("[sched] {} created: {:?}", id, params);
        Ok(id)
    }

    /// Drop the caller's reference to a constraint
    ///
    /// A constraint still attached somewhere turns `Dying`: it keeps working
    /// for its users but can no longer be attached, and goes away with the
    /// last detach.
    pub fn release_constraint(&mut self, id: ConstraintId) -> SchedResult<()> {
        match self.constraints.lifecycle(id) {
            None => return Err(SchedError::NotFound),
            Some(Lifecycle::Dying) => return Err(SchedError::InvalidState),
            Some(Lifecycle::Live) => {}
        }
        if self.constraints.dec_ref(id)? == 0 {
            self.destroy_constraint(id);
        } else {
            self.constraints.mark_dying(id);
            log::debug!("[sched] {} dying", id);
        }
        self.sync_timers();
        Ok(())
    }

    /// Attach constraint `id` to the scheduling context of `thread`
    pub fn attach(&mut self, thread: ThreadId, id: ConstraintId) -> SchedResult<()> {
        let sc = self.sc_of(thread)?;
        self.check_live(id)?;
        let ctx = self.contexts.get(sc).ok_or(SchedError::NotFound)?;
        ctx.attach(id)?;
        let home = ctx.home();
        self.constraints.inc_ref(id)?;
        log::debug!("[sched] {} attached to {}", id, sc);

        if let Some(cpu) = home {
            self.run_hook(id, cpu, |c, env| c.migrate_to(env));
            let i = cpu.index();
            if self.cpus[i].rq.active() == Some(sc) {
                self.run_hook(id, cpu, |c, env| c.activate(env));
                self.rearm_timeslice(cpu);
                if !self.constraints.get(id).is_some_and(Constraint::can_run) {
                    self.cpus[i].need_resched = true;
                }
            } else if !self.cpus[i].rq.is_queued(sc) {
                self.wake(sc);
            }
        }
        self.sync_timers();
        Ok(())
    }

    /// Detach constraint `id` from the scheduling context of `thread`
    ///
    /// A context left without constraints is taken off its ready queue.
    pub fn detach(&mut self, thread: ThreadId, id: ConstraintId) -> SchedResult<()> {
        let sc = self.sc_of(thread)?;
        let ctx = self.contexts.get(sc).ok_or(SchedError::NotFound)?;
        let was_blocking = ctx.detach(id)?;
        let home = ctx.home();
        let constrained = ctx.is_constrained();
        log::debug!("[sched] {} detached from {}", id, sc);

        if was_blocking {
            if let Some(constraint) = self.constraints.get_mut(id) {
                constraint.unblock(sc);
            }
        }
        if let Some(cpu) = home {
            let i = cpu.index();
            let active = self.cpus[i].rq.active() == Some(sc);
            if active {
                self.run_hook(id, cpu, |c, env| c.deactivate(env));
                self.rearm_timeslice(cpu);
            }
            if !constrained {
                if active {
                    self.deactivate(cpu, sc);
                    self.cpus[i].need_resched = true;
                }
                self.cpus[i].rq.dequeue(sc);
            } else if was_blocking {
                self.wake(sc);
            }
        }

        self.put_constraint(id);
        self.sync_timers();
        Ok(())
    }

    /// Install (or clear) the constraint attached on every run-thread
    pub fn set_global_constraint(&mut self, id: Option<ConstraintId>) -> SchedResult<()> {
        if let Some(id) = id {
            self.check_live(id)?;
            self.constraints.inc_ref(id)?;
        }
        if let Some(old) = core::mem::replace(&mut self.global, id) {
            self.put_constraint(old);
        }
        match id {
            Some(id) => log::info!("[sched] global constraint {}", id),
            None => log::info!("[sched] global constraint cleared"),
        }
        self.sync_timers();
        Ok(())
    }

    /// Switch the run flag of a gate (`None` inverts it)
    pub fn set_gate(&mut self, id: ConstraintId, run: Option<bool>) -> SchedResult<()> {
        let constraint = self.constraints.get(id).ok_or(SchedError::NotFound)?;
        if constraint.constraint_type() != ConstraintType::Gate {
            return Err(SchedError::NotImplemented);
        }
        let cpu = self.online_mask().first().unwrap_or(CpuId::BOOT);
        self.run_hook(id, cpu, |c, env| match c {
            ConstraintKind::Gate(gate) => match run {
                Some(run) => gate.set(env, run),
                None => gate.flip(env),
            },
            _ => Effects::empty(),
        });
        self.sync_timers();
        Ok(())
    }

    /// Snapshot of a constraint
    pub fn constraint_info(&self, id: ConstraintId) -> SchedResult<ConstraintInfo> {
        let constraint = self.constraints.get(id).ok_or(SchedError::NotFound)?;
        Ok(ConstraintInfo {
            ty: constraint.constraint_type(),
            run: constraint.can_run(),
            refs: self.constraints.refs(id).unwrap_or(0),
            blocked: constraint.blocked_len(),
            remaining: constraint.kind().remaining(self.clock.now()),
            dying: self.constraints.lifecycle(id) == Some(Lifecycle::Dying),
        })
    }

    /// Drop one reference; the last one destroys the constraint
    pub(super) fn put_constraint(&mut self, id: ConstraintId) {
        if let Ok(0) = self.constraints.dec_ref(id) {
            self.destroy_constraint(id);
        }
    }

    fn destroy_constraint(&mut self, id: ConstraintId) {
        let Some(mut constraint) = self.constraints.remove(id) else {
            return;
        };
        constraint.kind_mut().teardown(&mut self.timers);
        for sc in constraint.take_blocked() {
            if let Some(ctx) = self.contexts.get(sc) {
                ctx.clear_blocked(id);
            }
            self.wake(sc);
        }
        log::debug!("[sched] {} destroyed", id);
    }

    fn check_live(&self, id: ConstraintId) -> SchedResult<()> {
        match self.constraints.lifecycle(id) {
            Some(Lifecycle::Live) => Ok(()),
            Some(Lifecycle::Dying) => Err(SchedError::InvalidState),
            None => Err(SchedError::NotFound),
        }
    }

    // =========================================================================
    // Placement
    // =========================================================================

    /// Place `thread` on a CPU and make it runnable there
    ///
    /// Returns the CPU chosen. `caller` is the CPU the request was made on.
    ///
    /// # Panics
    ///
    /// Panics if the context has no constraints and baseline allocation is
    /// disabled.
    pub fn run_thread(
        &mut self,
        thread: ThreadId,
        params: RunParams,
        caller: CpuId,
    ) -> SchedResult<CpuId> {
        let sc = self.sc_of(thread)?;
        let cpu = self.resolve_cpu(sc, &params.cpus, caller)?;
        let quantum = match params.quantum {
            0 => self.config.default_time_slice,
            quantum => quantum,
        };

        let constrained = self
            .contexts
            .get(sc)
            .is_some_and(SchedContext::is_constrained);
        if !constrained {
            if !self.config.baseline_constraint {
                panic!("[sched] {} has no scheduling constraints", sc);
            }
            let id = self.create_constraint(ConstraintParams::Quantum { quantum })?;
            let attached = self.attach(thread, id);
            self.put_constraint(id);
            attached?;
        }

        if let Some(global) = self.global {
            let attached = self.contexts.get(sc).is_some_and(|ctx| ctx.contains(global));
            if !attached {
                if let Err(err) = self.attach(thread, global) {
                    log::warn!(
                        "[sched] global constraint {} not attached to {}: {}",
                        global,
                        sc,
                        err
                    );
                }
            }
        }

        self.migrate(
            sc,
            MigrationInfo {
                cpu,
                prio: params.prio,
                quantum,
            },
        );
        log::info!("[sched] run {:?} ({}) on {}", thread, sc, cpu);
        self.sync_timers();
        Ok(cpu)
    }

    /// Change the priority of `thread`
    pub fn set_priority(&mut self, thread: ThreadId, prio: Priority) -> SchedResult<()> {
        let sc = self.sc_of(thread)?;
        self.set_prio(sc, prio);
        Ok(())
    }

    /// Idle time of the first online CPU in `cpus`
    pub fn idle_time_in(&self, cpus: &CpuSet) -> SchedResult<Time> {
        let cpu = cpus
            .first(self.online_mask(), self.config.max_cpus)
            .ok_or(SchedError::InvalidArgument)?;
        self.idle_time(cpu)
    }

    /// Notify the hotplug interrupt, if one is bound
    pub fn trigger_hotplug_event(&self) -> bool {
        self.icu.trigger()
    }

    fn resolve_cpu(&self, sc: ScId, cpus: &CpuSet, caller: CpuId) -> SchedResult<CpuId> {
        let online = self.online_mask();
        let usable = |cpu: CpuId| online.contains(cpu) && cpus.contains(cpu);

        if let Some(home) = self.contexts.get(sc).and_then(SchedContext::home) {
            if usable(home) {
                return Ok(home);
            }
        }
        if usable(caller) {
            return Ok(caller);
        }
        cpus.first(online, self.config.max_cpus)
            .ok_or(SchedError::InvalidArgument)
    }

    fn migrate(&mut self, sc: ScId, info: MigrationInfo) {
        let Some(from) = self.contexts.get(sc).map(SchedContext::home) else {
            return;
        };
        if from == Some(info.cpu) {
            self.set_prio(sc, info.prio);
            return;
        }

        if let Some(from) = from {
            let i = from.index();
            if self.cpus[i].rq.active() == Some(sc) {
                self.deactivate(from, sc);
                self.cpus[i].need_resched = true;
            }
            self.cpus[i].rq.dequeue(sc);
            self.fan_out(sc, from, |c, env| c.migrate_away(env));
            self.metrics.record_migration();
            log::debug!("[sched] {} migrates {} -> {}", sc, from, info.cpu);
        }

        if let Some(ctx) = self.contexts.get_mut(sc) {
            ctx.set_home(info.cpu);
            ctx.set_prio(info.prio);
        }
        self.fan_out(sc, info.cpu, |c, env| c.migrate_to(env));
        self.wake(sc);
    }

    fn set_prio(&mut self, sc: ScId, prio: Priority) {
        let Some(ctx) = self.contexts.get_mut(sc) else {
            return;
        };
        if ctx.prio() == prio {
            return;
        }
        ctx.set_prio(prio);
        let Some(home) = ctx.home() else {
            return;
        };

        let percpu = &mut self.cpus[home.index()];
        if percpu.rq.dequeue(sc) {
            let pos = if percpu.rq.active() == Some(sc) {
                Position::Front
            } else {
                Position::Back
            };
            percpu.rq.enqueue(sc, prio, pos);
            percpu.rq.set_active_prio(sc, prio);
            percpu.need_resched = true;
        }
    }

    // =========================================================================
    // Thread readiness
    // =========================================================================

    /// A thread becomes ready
    ///
    /// `crs` is the priority the caller runs at, if any. Returns whether the
    /// home CPU should switch. With `lazy` set and a `true` result the
    /// context is not queued; the caller follows up with
    /// [`Scheduler::switch_to`].
    pub fn deblock(
        &mut self,
        thread: ThreadId,
        crs: Option<Priority>,
        lazy: bool,
    ) -> SchedResult<bool> {
        let sc = self.sc_of(thread)?;
        let ctx = self.contexts.get(sc).ok_or(SchedError::NotFound)?;
        let home = ctx.home().ok_or(SchedError::InvalidState)?;
        let entry = self.threads.get_mut(&thread).ok_or(SchedError::NotFound)?;
        if entry.state().contains(ThreadState::DEAD) {
            return Err(SchedError::InvalidState);
        }
        entry.set_ready(true);

        if ctx.blocked_by().is_some() || !ctx.is_constrained() {
            return Ok(false);
        }
        let prio = ctx.prio();
        let percpu = &mut self.cpus[home.index()];
        let preempt = percpu.rq.deblock(sc, prio, crs, lazy);
        if preempt && !lazy {
            percpu.need_resched = true;
        }
        Ok(preempt)
    }

    /// A thread becomes ready, queued right away
    pub fn thread_ready(&mut self, thread: ThreadId) -> SchedResult<bool> {
        self.deblock(thread, None, false)
    }

    /// A thread blocks outside the constraint system
    ///
    /// A running thread keeps its queue slot until the next scheduling pass
    /// drops it.
    pub fn thread_block(&mut self, thread: ThreadId) -> SchedResult<()> {
        let sc = self.sc_of(thread)?;
        if let Some(entry) = self.threads.get_mut(&thread) {
            entry.set_ready(false);
        }
        if let Some(home) = self.contexts.get(sc).and_then(SchedContext::home) {
            let percpu = &mut self.cpus[home.index()];
            if percpu.rq.active() == Some(sc) {
                percpu.need_resched = true;
            } else {
                percpu.rq.dequeue(sc);
            }
        }
        Ok(())
    }

    /// Make `thread` current on `cpu` directly, after a lazy deblock
    ///
    /// Falls back to a full scheduling pass if a constraint denies it.
    pub fn switch_to(&mut self, cpu: CpuId, thread: ThreadId) -> SchedResult<Option<ThreadId>> {
        let sc = self.sc_of(thread)?;
        let home = self.contexts.get(sc).and_then(SchedContext::home);
        if home != Some(cpu) || !self.is_online(cpu) || !self.is_thread_ready(thread) {
            return Err(SchedError::InvalidState);
        }
        if !self.sc_can_run(sc) {
            return Ok(self.schedule(cpu));
        }

        let i = cpu.index();
        self.cpus[i].begin_schedule();
        self.set_current(cpu, sc);
        self.cpus[i].end_schedule();
        self.sync_timers();
        Ok(self.current(cpu))
    }

    /// Check whether `thread` could run right now, without blocking it
    pub fn can_run(&self, thread: ThreadId) -> SchedResult<bool> {
        let sc = self.sc_of(thread)?;
        let ctx = self.contexts.get(sc).ok_or(SchedError::NotFound)?;
        Ok(ctx.blocked_by().is_none()
            && ctx.is_constrained()
            && ctx
                .constraints()
                .into_iter()
                .all(|id| self.constraints.get(id).map_or(true, Constraint::can_run)))
    }
}
