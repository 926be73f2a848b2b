//! User-level interrupt handling
//!
//! A claimed interrupt line forwards its occurrences as signals to a
//! context chosen by the driver. Delivery masks the line; the driver
//! acknowledges the interrupt after servicing the device, which unmasks
//! it. Occurrences on a masked line are dropped, matching edge-triggered
//! hardware that has no queue either.

use crate::cap::{ObjectId, ObjectPayload};
use crate::signal::ContextId;
use crate::Kernel;
use bitflags::bitflags;

/// Interrupt-line identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IrqId(pub(crate) u32);

impl IrqId {
    /// Raw line number.
    pub fn raw(&self) -> u32 {
        self.0
    }
}

bitflags! {
    /// Trigger and polarity configuration of an interrupt line.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct IrqMode: u8 {
        /// Edge-triggered; level-triggered when absent.
        const EDGE_TRIGGERED = 1 << 0;
        /// Active-low; active-high when absent.
        const ACTIVE_LOW = 1 << 1;
    }
}

/// IRQ-subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqError {
    /// The line is already claimed by a driver.
    LineAlreadyClaimed,
    /// No claimed line with the given number exists.
    UnknownIrq,
}

/// A claimed interrupt line.
pub struct UserIrq {
    object: ObjectId,
    mode: IrqMode,
    context: ContextId,
    /// Unmasked and ready to deliver.
    enabled: bool,
}

impl UserIrq {
    /// Configured trigger mode.
    pub fn mode(&self) -> IrqMode {
        self.mode
    }
}

/// IRQ operations on the kernel facade.
impl Kernel {
    /// Claim an interrupt line and wire it to a signal context.
    ///
    /// The line starts unmasked.
    pub fn new_irq(&self, line: u32, mode: IrqMode, ctx: ContextId) -> Result<IrqId, IrqError> {
        let id = IrqId(line);
        let mut irqs = self.irqs.write();
        if irqs.contains_key(&id) {
            return Err(IrqError::LineAlreadyClaimed);
        }
        let object = self.caps.new_object(ObjectPayload::Irq(id));
        irqs.insert(
            id,
            UserIrq {
                object,
                mode,
                context: ctx,
                enabled: true,
            },
        );
        log::debug!("irq line {} claimed, mode {:?}", line, mode);
        Ok(id)
    }

    /// Hardware occurrence on a line: deliver and mask.
    pub fn receive_irq(&self, line: u32) -> Result<(), IrqError> {
        let ctx = {
            let mut irqs = self.irqs.write();
            let irq = irqs.get_mut(&IrqId(line)).ok_or(IrqError::UnknownIrq)?;
            if !irq.enabled {
                // Occurrence on a masked line; the driver is still busy.
                return Ok(());
            }
            irq.enabled = false;
            irq.context
        };
        if self.submit_to_context(ctx, 1).is_err() {
            log::warn!("irq line {} fired into a dead context", line);
        }
        Ok(())
    }

    /// Driver acknowledgement: unmask the line.
    pub fn ack_irq(&self, line: u32) -> Result<(), IrqError> {
        let mut irqs = self.irqs.write();
        let irq = irqs.get_mut(&IrqId(line)).ok_or(IrqError::UnknownIrq)?;
        irq.enabled = true;
        Ok(())
    }

    /// Release a line, invalidating capabilities referring to it.
    pub fn destroy_irq(&self, line: u32) -> Result<(), IrqError> {
        let irq = self
            .irqs
            .write()
            .remove(&IrqId(line))
            .ok_or(IrqError::UnknownIrq)?;
        if self.caps.destroy_object(irq.object).is_err() {
            log::warn!("irq line {} had no backing object", line);
        }
        Ok(())
    }

    /// Kernel object backing a claimed line.
    pub fn irq_object(&self, line: u32) -> Option<ObjectId> {
        self.irqs.read().get(&IrqId(line)).map(|i| i.object)
    }

    /// Trigger mode of a claimed line.
    pub fn irq_mode(&self, line: u32) -> Option<IrqMode> {
        self.irqs.read().get(&IrqId(line)).map(|i| i.mode)
    }
}
