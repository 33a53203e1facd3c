//! # Global Scheduler Instance
//!
//! The kernel installs one [`Scheduler`] at boot. Its lock serialises every
//! scheduling operation and every timer and counter interrupt entry.

use crate::{SchedError, SchedResult, Scheduler};
use spin::{Mutex, Once};

static SCHEDULER: Once<Mutex<Scheduler>> = Once::new();

/// Install the global scheduler
///
/// Fails with `InvalidState` if one is already installed.
pub fn init(scheduler: Scheduler) -> SchedResult<()> {
    if SCHEDULER.is_completed() {
        return Err(SchedError::InvalidState);
    }
    let mut installed = false;
    SCHEDULER.call_once(|| {
        installed = true;
        Mutex::new(scheduler)
    });
    if !installed {
        return Err(SchedError::InvalidState);
    }
    log::info!("[sched] global scheduler installed");
    Ok(())
}

/// Check whether the global scheduler is installed
pub fn is_initialized() -> bool {
    SCHEDULER.is_completed()
}

/// Run `f` with the global scheduler locked
///
/// Returns `None` before [`init`].
pub fn with_scheduler<R>(f: impl FnOnce(&mut Scheduler) -> R) -> Option<R> {
    SCHEDULER.get().map(|scheduler| f(&mut scheduler.lock()))
}
