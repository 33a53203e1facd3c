//! Selecting the running context, timer expiry and constraint effects.

use super::Scheduler;
use crate::constraint::{Constraint, ConstraintHooks, ConstraintKind, Effects};
use crate::context::SchedContext;
use crate::percpu::PerCpu;
use crate::ready_queue::Position;
use crate::timeout::TimerOwner;
use crate::{ConstraintId, CpuId, ScId, ThreadId};
use tempo_hal::perf::Counter;

impl Scheduler {
    /// Pick and switch to the context that should run on `cpu`
    ///
    /// Walks the ready queue from the top: contexts whose thread is not
    /// ready are dropped, contexts denied by a constraint are blocked on
    /// it. The CPU idles once the queue is exhausted.
    ///
    /// # Panics
    ///
    /// Panics on a reentrant call for the same CPU or when a queued context
    /// has no constraints.
    pub fn schedule(&mut self, cpu: CpuId) -> Option<ThreadId> {
        let i = cpu.index();
        if !self.is_online(cpu) {
            return None;
        }
        self.cpus[i].begin_schedule();

        let prev = self.cpus[i].rq.active();
        let next = loop {
            let Some(sc) = self.cpus[i].rq.next_to_run() else {
                break None;
            };
            let Some(ctx) = self.contexts.get(sc) else {
                self.cpus[i].rq.dequeue(sc);
                continue;
            };
            assert!(ctx.is_constrained(), "{} queued without scheduling constraints", sc);
            if !self.is_thread_ready(ctx.thread()) {
                self.cpus[i].rq.dequeue(sc);
                continue;
            }
            if self.sc_can_run(sc) {
                break Some(sc);
            }
        };

        match next {
            Some(sc) => self.set_current(cpu, sc),
            None => self.go_idle(cpu),
        }
        if let Some(prev) = prev.filter(|&prev| Some(prev) != next) {
            if self.cpus[i].rq.is_queued(prev) {
                self.metrics.record_preemption();
            }
        }

        self.cpus[i].end_schedule();
        self.sync_timers();
        self.current(cpu)
    }

    /// Run a reschedule pass on every online CPU that has one pending
    pub fn schedule_pending(&mut self) {
        for i in 0..self.cpus.len() {
            let cpu = self.cpus[i].id();
            if self.cpus[i].is_online() && self.cpus[i].need_resched {
                self.schedule(cpu);
            }
        }
    }

    /// Rotate the running context behind its peers and reschedule
    pub fn yield_current(&mut self, cpu: CpuId) -> Option<ThreadId> {
        if let Some(sc) = self.current_sc(cpu) {
            if let Some(prio) = self.contexts.get(sc).map(SchedContext::prio) {
                self.cpus[cpu.index()].rq.requeue(sc, prio);
            }
        }
        self.schedule(cpu)
    }

    /// Dispatch every timer of `cpu` that is due
    ///
    /// Returns whether a reschedule pass is needed before returning from
    /// the interrupt.
    pub fn expire_timers(&mut self, cpu: CpuId) -> bool {
        if !self.is_online(cpu) {
            return false;
        }
        let now = self.clock.now();
        while let Some(owner) = self.timers.pop_expired(cpu, now) {
            self.metrics.record_timer_expiration();
            log::trace!("[sched] {:?} expired on {} at {}", owner, cpu, now);
            match owner {
                TimerOwner::Timeslice => self.timeslice_expired(cpu),
                TimerOwner::Constraint(id) => {
                    self.run_hook(id, cpu, |c, env| c.timer_expired(env));
                }
            }
        }
        self.sync_timers();
        self.cpus[cpu.index()].need_resched
    }

    /// Timer interrupt entry: expire timers, then reschedule if needed
    pub fn timer_interrupt(&mut self, cpu: CpuId) -> Option<ThreadId> {
        if self.expire_timers(cpu) {
            self.schedule(cpu)
        } else {
            self.current(cpu)
        }
    }

    /// Performance-counter overflow entry
    ///
    /// Throttles the bandwidth constraints of the running context. Returns
    /// whether a reschedule pass is needed.
    pub fn handle_bandwidth_overflow(&mut self, cpu: CpuId) -> bool {
        if !self.is_online(cpu) {
            return false;
        }
        for counter in Counter::ALL {
            self.perf.ack_overflow(cpu, counter);
        }
        let Some(sc) = self.current_sc(cpu) else {
            return false;
        };
        let ids = self
            .contexts
            .get(sc)
            .map(SchedContext::constraints)
            .unwrap_or_default();
        for id in ids {
            let kind = self.constraints.get(id).map(Constraint::kind);
            if matches!(kind, Some(ConstraintKind::Bandwidth(_))) {
                self.run_hook(id, cpu, |c, env| c.counter_overflow(env));
            }
        }
        self.sync_timers();
        self.cpus[cpu.index()].need_resched
    }

    /// End of the running context's allotment on `cpu`
    fn timeslice_expired(&mut self, cpu: CpuId) {
        let i = cpu.index();
        self.cpus[i].timeslice.expire();
        self.cpus[i].need_resched = true;

        let now = self.clock.now();
        let Some(sc) = self.cpus[i].rq.active() else {
            return;
        };
        let ids = self
            .contexts
            .get(sc)
            .map(SchedContext::constraints)
            .unwrap_or_default();
        for id in ids {
            let due = self
                .constraints
                .get(id)
                .and_then(|c| c.kind().exhaustion(cpu))
                .is_some_and(|deadline| deadline <= now);
            if due {
                self.run_hook(id, cpu, |c, env| c.timeslice_expired(env));
            }
        }
    }

    /// Make `next` the running context of `cpu`
    pub(super) fn set_current(&mut self, cpu: CpuId, next: ScId) {
        let i = cpu.index();
        let prev = self.cpus[i].rq.active();
        if prev == Some(next) && self.cpus[i].timeslice.is_set() {
            return;
        }
        let Some(prio) = self.contexts.get(next).map(SchedContext::prio) else {
            return;
        };
        if let Some(prev) = prev {
            self.deactivate(cpu, prev);
        }

        let now = self.clock.now();
        let percpu = &mut self.cpus[i];
        percpu.rq.enqueue(next, prio, Position::Front);
        percpu.rq.activate(next, prio);
        percpu.leave_idle(now);

        self.fan_out(next, cpu, |c, env| c.activate(env));
        self.rearm_timeslice(cpu);

        if prev != Some(next) {
            self.metrics.record_context_switch();
            log::debug!("[sched] {}: switch {:?} -> {}", cpu, prev, next);
        }
    }

    /// The running context of `cpu` stops running
    pub(super) fn deactivate(&mut self, cpu: CpuId, sc: ScId) {
        self.fan_out(sc, cpu, |c, env| c.deactivate(env));
        let percpu = &mut self.cpus[cpu.index()];
        self.timers.reset(&mut percpu.timeslice);
        percpu.rq.invalidate();
    }

    fn go_idle(&mut self, cpu: CpuId) {
        if let Some(prev) = self.cpus[cpu.index()].rq.active() {
            self.deactivate(cpu, prev);
            log::debug!("[sched] {}: idle", cpu);
        }
        let now = self.clock.now();
        self.cpus[cpu.index()].enter_idle(now);
    }

    /// Arm the timeslice at the earliest exhaustion deadline of the
    /// running context's constraints
    pub(super) fn rearm_timeslice(&mut self, cpu: CpuId) {
        let i = cpu.index();
        self.timers.reset(&mut self.cpus[i].timeslice);

        let Some(ctx) = self.cpus[i].rq.active().and_then(|sc| self.contexts.get(sc)) else {
            return;
        };
        let deadline = ctx
            .constraints()
            .into_iter()
            .filter_map(|id| self.constraints.get(id))
            .filter_map(|c| c.kind().exhaustion(cpu))
            .min();
        if let Some(deadline) = deadline {
            let percpu: &mut PerCpu = &mut self.cpus[i];
            self.timers
                .set(&mut percpu.timeslice, cpu, deadline, TimerOwner::Timeslice);
        }
    }

    /// Evaluate the constraints of `sc`
    ///
    /// The first constraint that denies running becomes the blocking
    /// reason and `sc` is registered on it.
    pub(super) fn sc_can_run(&mut self, sc: ScId) -> bool {
        let blocker = {
            let Some(ctx) = self.contexts.get(sc) else {
                return false;
            };
            if ctx.blocked_by().is_some() {
                return false;
            }
            ctx.constraints().into_iter().find(|&id| {
                self.constraints
                    .get(id)
                    .is_some_and(|constraint| !constraint.can_run())
            })
        };
        match blocker {
            Some(id) => {
                self.block_on(sc, id);
                false
            }
            None => true,
        }
    }

    /// Take `sc` off its ready queue and register it on constraint `id`
    fn block_on(&mut self, sc: ScId, id: ConstraintId) {
        if let Some(constraint) = self.constraints.get_mut(id) {
            constraint.block(sc);
        }
        if let Some(ctx) = self.contexts.get(sc) {
            ctx.set_blocked(id);
            if let Some(home) = ctx.home() {
                self.cpus[home.index()].rq.dequeue(sc);
            }
        }
        self.metrics.record_block();
        log::debug!("[sched] {} blocked on {}", sc, id);
    }

    /// Move every context blocked on `id` back to its home ready queue
    fn release_all(&mut self, id: ConstraintId) {
        let Some(constraint) = self.constraints.get_mut(id) else {
            return;
        };
        let blocked = constraint.take_blocked();
        if !blocked.is_empty() {
            log::debug!("[sched] {} releases {} contexts", id, blocked.len());
        }
        for sc in blocked {
            if let Some(ctx) = self.contexts.get(sc) {
                ctx.clear_blocked(id);
                self.metrics.record_release();
                self.wake(sc);
            }
        }
    }

    /// Enqueue a ready, unblocked context on its current home CPU
    ///
    /// Returns whether the home CPU should reschedule.
    pub(super) fn wake(&mut self, sc: ScId) -> bool {
        let Some(ctx) = self.contexts.get(sc) else {
            return false;
        };
        let Some(home) = ctx.home() else {
            return false;
        };
        if ctx.blocked_by().is_some()
            || !ctx.is_constrained()
            || !self.is_thread_ready(ctx.thread())
        {
            return false;
        }
        let prio = ctx.prio();
        let percpu = &mut self.cpus[home.index()];
        let preempt = percpu.rq.deblock(sc, prio, None, false);
        if preempt {
            percpu.need_resched = true;
        }
        log::debug!("[sched] {} ready on {} ({} queued)", sc, home, percpu.rq.len());
        preempt
    }

    /// Carry out the effects reported by a hook of constraint `id` on `cpu`
    pub(super) fn apply_effects(&mut self, id: ConstraintId, cpu: CpuId, effects: Effects) {
        if effects.is_empty() {
            return;
        }
        if effects.contains(Effects::OVERRUN) {
            self.metrics.record_budget_overrun();
        }
        if effects.contains(Effects::EXHAUSTED) {
            self.metrics.record_exhaustion();
        }
        if effects.contains(Effects::REPLENISHED) {
            self.metrics.record_replenishment();
        }
        if effects.contains(Effects::THROTTLED) {
            self.metrics.record_throttle();
        }

        if effects.contains(Effects::ROTATE) {
            if let Some(sc) = self.current_sc(cpu) {
                if let Some(prio) = self.contexts.get(sc).map(SchedContext::prio) {
                    self.cpus[cpu.index()].rq.requeue(sc, prio);
                }
            }
        }

        let running = self.cpus_running(id);
        if effects.intersects(Effects::RESCHEDULE | Effects::CLEAR_RUN) {
            if let Some(percpu) = self.cpus.get_mut(cpu.index()) {
                percpu.need_resched = true;
            }
            for other in running.iter() {
                self.cpus[other.index()].need_resched = true;
            }
        }

        if effects.contains(Effects::RELEASE) {
            self.release_all(id);
        }
        if effects.contains(Effects::REARM_TIMESLICE) {
            for other in running.iter() {
                self.rearm_timeslice(other);
            }
        }
        if effects.contains(Effects::PROGRAM_COUNTERS) {
            for other in running.iter() {
                self.program_counters(other, id);
            }
        }
    }
}
