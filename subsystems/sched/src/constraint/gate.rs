//! Gate constraint: a run flag switched explicitly, without timers.

use super::{word, ConstraintHooks, ConstraintParams, Effects, Env};
use crate::config::SchedConfig;
use crate::invoke::Mword;
use crate::SchedResult;

/// Explicitly switched run flag
#[derive(Debug, Default)]
pub struct Gate {
    switches: u64,
}

impl Gate {
    /// Create a gate
    pub const fn new() -> Self {
        Self { switches: 0 }
    }

    /// Number of run-flag changes so far
    pub const fn switches(&self) -> u64 {
        self.switches
    }

    /// Switch the run flag
    ///
    /// Opening the gate releases everything blocked on it; closing it makes
    /// running users re-evaluate.
    pub fn set(&mut self, env: &Env<'_>, run: bool) -> Effects {
        if run != env.run {
            self.switches += 1;
        }
        if run {
            Effects::SET_RUN | Effects::RELEASE | Effects::RESCHEDULE
        } else {
            Effects::CLEAR_RUN | Effects::RESCHEDULE
        }
    }

    /// Invert the run flag
    pub fn flip(&mut self, env: &Env<'_>) -> Effects {
        self.set(env, !env.run)
    }
}

impl ConstraintHooks for Gate {}

/// `[label, _, tag, (run)]`
pub(crate) fn parse(words: &[Mword], _config: &SchedConfig) -> SchedResult<ConstraintParams> {
    word(words, 2)?;
    let run = words.get(3).is_some_and(|&w| w != 0);
    Ok(ConstraintParams::Gate { run })
}
