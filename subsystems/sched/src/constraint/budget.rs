//! Periodic budget constraint.
//!
//! A user may run for `budget` per `period`. Consumption is not counted
//! down; instead the activation records an exhaustion deadline
//! (`now + left`) and the remainder is recomputed from the clock on
//! deactivation. A replenishment timer refills the budget at every period
//! boundary. Boundaries missed while the constraint was not armed are
//! skipped, never replayed, so the boundary only moves forward.

use super::{word, ConstraintHooks, ConstraintParams, Effects, Env};
use crate::config::SchedConfig;
use crate::invoke::Mword;
use crate::timeout::{Timeout, Timers};
use crate::{CpuId, SchedResult, Time, TimeDelta};
use tempo_hal::time_diff;

/// Budget/period reservation
#[derive(Debug)]
pub struct Budget {
    budget: Time,
    period: Time,
    left: Time,
    exhaustion: Option<(CpuId, Time)>,
    next_repl: Time,
    repl: Timeout,
    placed: bool,
}

impl Budget {
    /// Create a budget constraint with a full budget
    pub const fn new(budget: Time, period: Time) -> Self {
        Self {
            budget,
            period,
            left: budget,
            exhaustion: None,
            next_repl: 0,
            repl: Timeout::new(),
            placed: false,
        }
    }

    /// Budget per period
    pub const fn budget(&self) -> Time {
        self.budget
    }

    /// Replenishment period
    pub const fn period(&self) -> Time {
        self.period
    }

    /// Budget left, as of the last deactivation
    pub const fn left(&self) -> Time {
        self.left
    }

    /// Next replenishment boundary
    pub const fn next_replenishment(&self) -> Time {
        self.next_repl
    }

    /// Replenishment timer
    pub const fn replenishment_timer(&self) -> &Timeout {
        &self.repl
    }

    /// Advance the boundary past `now`, skipping missed periods
    fn catch_up(&mut self, now: Time) {
        if now < self.next_repl {
            return;
        }
        let missed = (now - self.next_repl) / self.period;
        let skip = (missed + 1).saturating_mul(self.period);
        self.next_repl = self.next_repl.saturating_add(skip);
    }

    /// Settle an overdue deadline; returns whether it was overrun
    fn settle(&mut self, deadline: Time, now: Time) -> bool {
        let left = time_diff(deadline, now);
        if left < 0 {
            log::warn!("[budget] budget overrun by {}us", left.unsigned_abs());
            self.left = 0;
            true
        } else {
            self.left = left.unsigned_abs();
            false
        }
    }
}

impl ConstraintHooks for Budget {
    fn activate(&mut self, env: &mut Env<'_>) -> Effects {
        if self.exhaustion.is_none() {
            self.exhaustion = Some((env.cpu, env.now.saturating_add(self.left)));
        }
        Effects::empty()
    }

    fn deactivate(&mut self, env: &mut Env<'_>) -> Effects {
        let Some((cpu, deadline)) = self.exhaustion else {
            return Effects::empty();
        };
        if cpu != env.cpu {
            return Effects::empty();
        }
        self.exhaustion = None;
        if self.settle(deadline, env.now) {
            Effects::OVERRUN
        } else {
            Effects::empty()
        }
    }

    fn migrate_away(&mut self, env: &mut Env<'_>) -> Effects {
        env.disarm_local(&mut self.repl);
        Effects::empty()
    }

    fn migrate_to(&mut self, env: &mut Env<'_>) -> Effects {
        let mut effects = Effects::empty();
        if !self.placed {
            self.placed = true;
            self.left = self.budget;
            self.next_repl = env.now.saturating_add(self.period);
        } else if env.now >= self.next_repl {
            self.catch_up(env.now);
            self.left = self.budget;
            effects = Effects::SET_RUN
                | Effects::RELEASE
                | Effects::RESCHEDULE
                | Effects::REPLENISHED;
        }

        if self.repl.cpu() != Some(env.cpu) {
            env.rearm(&mut self.repl, self.next_repl);
            log::debug!(
                "[budget] replenishment for {} armed on {} at {}",
                env.id,
                env.cpu,
                self.next_repl
            );
        }
        effects
    }

    fn exhaustion(&self, cpu: CpuId) -> Option<Time> {
        self.exhaustion
            .filter(|&(owner, _)| owner == cpu)
            .map(|(_, deadline)| deadline)
    }

    fn timeslice_expired(&mut self, env: &mut Env<'_>) -> Effects {
        let Some(deadline) = self.exhaustion(env.cpu) else {
            return Effects::empty();
        };
        if deadline > env.now {
            return Effects::empty();
        }
        self.exhaustion = None;
        let overrun = self.settle(deadline, env.now);
        self.left = 0;

        let mut effects = Effects::CLEAR_RUN | Effects::RESCHEDULE | Effects::EXHAUSTED;
        if overrun {
            effects |= Effects::OVERRUN;
        }
        effects
    }

    fn timer_expired(&mut self, env: &mut Env<'_>) -> Effects {
        self.repl.expire();
        self.left = self.budget;
        self.catch_up(env.now);
        // A boundary saturated at the end of time is never due again
        if self.next_repl > env.now {
            env.arm(&mut self.repl, self.next_repl);
        }

        let mut effects =
            Effects::SET_RUN | Effects::RELEASE | Effects::RESCHEDULE | Effects::REPLENISHED;
        if let Some((cpu, _)) = self.exhaustion {
            // Still running somewhere: the fresh budget starts now
            self.exhaustion = Some((cpu, env.now.saturating_add(self.budget)));
            effects |= Effects::REARM_TIMESLICE;
        }
        effects
    }

    fn remaining(&self, now: Time) -> Option<TimeDelta> {
        Some(match self.exhaustion {
            Some((_, deadline)) => time_diff(deadline, now),
            None => self.left as TimeDelta,
        })
    }

    fn teardown(&mut self, timers: &mut Timers) {
        timers.reset(&mut self.repl);
    }
}

/// `[label, _, tag, budget, period]`
pub(crate) fn parse(words: &[Mword], _config: &SchedConfig) -> SchedResult<ConstraintParams> {
    Ok(ConstraintParams::Budget {
        budget: word(words, 3)?,
        period: word(words, 4)?,
    })
}
