//! # Hotplug Interrupt Chip
//!
//! The scheduler object doubles as a one-pin interrupt controller. User
//! space binds an interrupt to pin 0 and is notified whenever a CPU comes
//! online or goes offline.

use crate::{SchedError, SchedResult};
use alloc::sync::Arc;
use bitflags::bitflags;

/// Receiver of hotplug notifications
pub trait HotplugIrq: Send + Sync {
    /// Deliver one notification for interrupt `irq`
    fn hit(&self, irq: u32);
}

bitflags! {
    /// Rights held on the interrupt capability passed to `bind`
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IrqRights: u8 {
        /// May be read
        const READ = 1 << 0;
        /// May be modified (required to bind)
        const WRITE = 1 << 1;
    }
}

/// Controller description returned by `info`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcuInfo {
    /// Feature bits
    pub features: u32,
    /// Number of interrupt pins
    pub nr_irqs: u32,
    /// Number of message-signalled interrupts
    pub nr_msis: u32,
}

/// One-pin interrupt controller for CPU hotplug events
#[derive(Default)]
pub struct IrqChip {
    bound: Option<(u32, Arc<dyn HotplugIrq>)>,
    mode: u32,
}

impl IrqChip {
    /// Create an unbound controller
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe the controller
    pub fn info(&self) -> IcuInfo {
        IcuInfo {
            features: 0,
            nr_irqs: 1,
            nr_msis: 0,
        }
    }

    /// Bind `irq` to `pin`, replacing any earlier binding
    pub fn bind(
        &mut self,
        pin: u32,
        irq: u32,
        sink: Arc<dyn HotplugIrq>,
        rights: IrqRights,
    ) -> SchedResult<()> {
        Self::check_pin(pin)?;
        if !rights.contains(IrqRights::WRITE) {
            return Err(SchedError::PermissionDenied);
        }
        if let Some((old, _)) = self.bound.replace((irq, sink)) {
            log::debug!("[hotplug] irq {} replaced by {}", old, irq);
        }
        Ok(())
    }

    /// Remove the binding of `pin`
    pub fn unbind(&mut self, pin: u32) -> SchedResult<()> {
        Self::check_pin(pin)?;
        self.bound = None;
        Ok(())
    }

    /// Set the trigger mode of `pin`
    pub fn set_mode(&mut self, pin: u32, mode: u32) -> SchedResult<()> {
        Self::check_pin(pin)?;
        self.mode = mode;
        Ok(())
    }

    /// Trigger mode of pin 0
    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Check whether an interrupt is bound
    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }

    /// Notify the bound interrupt, if any
    pub fn trigger(&self) -> bool {
        match &self.bound {
            Some((irq, sink)) => {
                log::debug!("[hotplug] raising irq {}", irq);
                sink.hit(*irq);
                true
            }
            None => false,
        }
    }

    fn check_pin(pin: u32) -> SchedResult<()> {
        if pin > 0 {
            Err(SchedError::InvalidArgument)
        } else {
            Ok(())
        }
    }
}

impl core::fmt::Debug for IrqChip {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrqChip")
            .field("irq", &self.bound.as_ref().map(|(irq, _)| *irq))
            .field("mode", &self.mode)
            .finish()
    }
}
