//! Memory-bandwidth throttle.
//!
//! Read and write rates are turned into cache-line event budgets per
//! measurement period and loaded into the performance counters whenever a
//! user starts running. A counter overflow means the budget of the current
//! period is spent: the run flag drops until the period timer resets the
//! counters.

use super::{word, ConstraintHooks, ConstraintParams, Effects, Env};
use crate::config::SchedConfig;
use crate::invoke::Mword;
use crate::timeout::{Timeout, Timers};
use crate::{SchedResult, Time, TimeDelta};
use tempo_hal::perf::Counter;

/// Bytes per cache line
const CACHE_LINE: u64 = 64;

/// Convert a rate in MB/s into cache-line events per millisecond
pub const fn mbs_to_cache_events(mbs: u64) -> u64 {
    mbs.saturating_mul(1000) / CACHE_LINE
}

/// Bandwidth throttle state
#[derive(Debug)]
pub struct Bandwidth {
    budgets: [u64; 2],
    period: Time,
    next: Time,
    timer: Timeout,
    periods: u64,
    throttles: u64,
}

impl Bandwidth {
    /// Create a throttle from read/write rates in MB/s
    pub const fn new(read_mbs: u64, write_mbs: u64, period: Time) -> Self {
        Self {
            budgets: [mbs_to_cache_events(read_mbs), mbs_to_cache_events(write_mbs)],
            period,
            next: 0,
            timer: Timeout::new(),
            periods: 0,
            throttles: 0,
        }
    }

    /// Event budget of one counter
    pub const fn budget(&self, counter: Counter) -> u64 {
        self.budgets[counter.index()]
    }

    /// Measurement period
    pub const fn period(&self) -> Time {
        self.period
    }

    /// Completed measurement periods
    pub const fn periods(&self) -> u64 {
        self.periods
    }

    /// Overflows seen so far
    pub const fn throttles(&self) -> u64 {
        self.throttles
    }

    /// Period timer
    pub const fn timer(&self) -> &Timeout {
        &self.timer
    }
}

impl ConstraintHooks for Bandwidth {
    fn activate(&mut self, _env: &mut Env<'_>) -> Effects {
        Effects::PROGRAM_COUNTERS
    }

    fn migrate_away(&mut self, env: &mut Env<'_>) -> Effects {
        env.disarm_local(&mut self.timer);
        Effects::empty()
    }

    fn migrate_to(&mut self, env: &mut Env<'_>) -> Effects {
        if self.timer.cpu() != Some(env.cpu) {
            if self.next <= env.now {
                self.next = env.now.saturating_add(self.period);
            }
            env.rearm(&mut self.timer, self.next);
        }
        Effects::empty()
    }

    fn timer_expired(&mut self, env: &mut Env<'_>) -> Effects {
        self.timer.expire();
        self.periods += 1;
        self.next = self.next.saturating_add(self.period);
        if self.next <= env.now {
            self.next = env.now.saturating_add(self.period);
        }
        if self.next > env.now {
            env.arm(&mut self.timer, self.next);
        }
        Effects::SET_RUN | Effects::RELEASE | Effects::RESCHEDULE | Effects::PROGRAM_COUNTERS
    }

    fn counter_overflow(&mut self, env: &mut Env<'_>) -> Effects {
        self.throttles += 1;
        log::debug!("[bandwidth] {} throttled on {}", env.id, env.cpu);
        Effects::CLEAR_RUN | Effects::RESCHEDULE | Effects::THROTTLED
    }

    fn remaining(&self, now: Time) -> Option<TimeDelta> {
        self.timer.get_remaining(now)
    }

    fn teardown(&mut self, timers: &mut Timers) {
        timers.reset(&mut self.timer);
    }
}

/// `[label, _, tag, read MB/s, write MB/s, (period)]`
pub(crate) fn parse(words: &[Mword], _config: &SchedConfig) -> SchedResult<ConstraintParams> {
    Ok(ConstraintParams::Bandwidth {
        read_mbs: word(words, 3)?,
        write_mbs: word(words, 4)?,
        period: words.get(5).copied().filter(|&period| period != 0),
    })
}
