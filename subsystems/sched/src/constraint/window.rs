//! Time-window constraint.
//!
//! Runnable only while `start <= now < start + duration`. One timer always
//! targets the next boundary: the entry while outside, the exit while
//! inside. With a period the window repeats at `start + k * period`.

use super::{word, ConstraintHooks, ConstraintParams, Effects, Env};
use crate::config::SchedConfig;
use crate::invoke::Mword;
use crate::timeout::{Timeout, Timers};
use crate::{SchedResult, Time, TimeDelta};

/// Admission window
#[derive(Debug)]
pub struct TimeWindow {
    start: Time,
    duration: Time,
    period: Option<Time>,
    timer: Timeout,
}

impl TimeWindow {
    /// Create a window; it is evaluated once placed on a CPU
    pub const fn new(start: Time, duration: Time, period: Option<Time>) -> Self {
        Self {
            start,
            duration,
            period,
            timer: Timeout::new(),
        }
    }

    /// Start of the current or next window
    pub const fn start(&self) -> Time {
        self.start
    }

    /// Window length
    pub const fn duration(&self) -> Time {
        self.duration
    }

    /// Repetition period
    pub const fn period(&self) -> Option<Time> {
        self.period
    }

    /// Boundary timer
    pub const fn timer(&self) -> &Timeout {
        &self.timer
    }

    const fn end(&self) -> Time {
        self.start.saturating_add(self.duration)
    }

    /// Re-evaluate the window at `env.now` and aim the timer at the next
    /// boundary
    fn sync(&mut self, env: &mut Env<'_>) -> Effects {
        let now = env.now;
        if let Some(period) = self.period {
            if now >= self.end() {
                self.start += (now - self.start) / period * period;
                if now >= self.end() {
                    self.start = self.start.saturating_add(period);
                }
            }
        }

        let inside = if now < self.start {
            env.rearm(&mut self.timer, self.start);
            false
        } else if now < self.end() {
            let end = self.end();
            env.rearm(&mut self.timer, end);
            true
        } else {
            env.timers.reset(&mut self.timer);
            false
        };

        log::debug!(
            "[window] {} {} at {}, next boundary {:?}",
            env.id,
            if inside { "open" } else { "closed" },
            now,
            self.timer.deadline()
        );

        match (inside, env.run) {
            (true, false) => Effects::SET_RUN | Effects::RELEASE | Effects::RESCHEDULE,
            (false, true) => Effects::CLEAR_RUN | Effects::RESCHEDULE,
            _ => Effects::empty(),
        }
    }
}

impl ConstraintHooks for TimeWindow {
    fn migrate_away(&mut self, env: &mut Env<'_>) -> Effects {
        env.disarm_local(&mut self.timer);
        Effects::empty()
    }

    fn migrate_to(&mut self, env: &mut Env<'_>) -> Effects {
        self.sync(env)
    }

    fn timer_expired(&mut self, env: &mut Env<'_>) -> Effects {
        self.timer.expire();
        self.sync(env)
    }

    fn remaining(&self, now: Time) -> Option<TimeDelta> {
        self.timer.get_remaining(now)
    }

    fn teardown(&mut self, timers: &mut Timers) {
        timers.reset(&mut self.timer);
    }
}

/// `[label, _, tag, start, duration, (period)]`
pub(crate) fn parse(words: &[Mword], _config: &SchedConfig) -> SchedResult<ConstraintParams> {
    Ok(ConstraintParams::TimeWindow {
        start: word(words, 3)?,
        duration: word(words, 4)?,
        period: words.get(5).copied().filter(|&period| period != 0),
    })
}
