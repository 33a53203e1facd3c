//! Round-robin quantum constraint.
//!
//! Always runnable. The running user gets `quantum` of run time; when it is
//! used up the user is rotated behind its priority peers and the quantum is
//! refilled. Time left over when a user is preempted is kept for its next
//! activation.

use super::{word, ConstraintHooks, ConstraintParams, Effects, Env};
use crate::config::SchedConfig;
use crate::invoke::Mword;
use crate::{CpuId, SchedResult, Time, TimeDelta};
use tempo_hal::time_diff;

/// Round-robin time slice
#[derive(Debug)]
pub struct Quantum {
    quantum: Time,
    left: Time,
    exhaustion: Option<(CpuId, Time)>,
}

impl Quantum {
    /// Create a quantum constraint with a full slice
    pub const fn new(quantum: Time) -> Self {
        Self {
            quantum,
            left: quantum,
            exhaustion: None,
        }
    }

    /// Configured slice length
    pub const fn quantum(&self) -> Time {
        self.quantum
    }

    /// Slice left for the next activation
    pub const fn left(&self) -> Time {
        self.left
    }

    fn replenish(&mut self) {
        self.left = self.quantum;
    }
}

impl ConstraintHooks for Quantum {
    fn activate(&mut self, env: &mut Env<'_>) -> Effects {
        if self.exhaustion.is_none() {
            self.exhaustion = Some((env.cpu, env.now.saturating_add(self.left)));
        }
        Effects::empty()
    }

    fn deactivate(&mut self, env: &mut Env<'_>) -> Effects {
        match self.exhaustion {
            Some((cpu, deadline)) if cpu == env.cpu => {
                self.exhaustion = None;
                let left = time_diff(deadline, env.now);
                if left > 0 {
                    self.left = left.unsigned_abs();
                } else {
                    self.replenish();
                }
            }
            _ => {}
        }
        Effects::empty()
    }

    fn exhaustion(&self, cpu: CpuId) -> Option<Time> {
        self.exhaustion
            .filter(|&(owner, _)| owner == cpu)
            .map(|(_, deadline)| deadline)
    }

    fn timeslice_expired(&mut self, env: &mut Env<'_>) -> Effects {
        if self.exhaustion(env.cpu).is_none() {
            return Effects::empty();
        }
        self.exhaustion = None;
        self.replenish();
        Effects::ROTATE | Effects::RESCHEDULE
    }

    fn remaining(&self, now: Time) -> Option<TimeDelta> {
        Some(match self.exhaustion {
            Some((_, deadline)) => time_diff(deadline, now),
            None => self.left as TimeDelta,
        })
    }
}

/// `[label, _, tag, quantum]`
pub(crate) fn parse(words: &[Mword], config: &SchedConfig) -> SchedResult<ConstraintParams> {
    let quantum = match word(words, 3)? {
        0 => config.default_time_slice,
        quantum => quantum,
    };
    Ok(ConstraintParams::Quantum { quantum })
}
