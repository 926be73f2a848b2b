//! Kernel objects and their identities
//!
//! Every capability ultimately names a kernel object. The object itself is
//! a tagged payload (thread, protection domain, signal receiver, signal
//! context, IRQ, virtual machine); the indirection from capability to
//! object goes through an [`Identity`](super::identity) record so that
//! object destruction can invalidate all outstanding capabilities without
//! touching them individually.

use super::identity::IdentityId;
use super::CapError;
use crate::irq::IrqId;
use crate::pd::PdId;
use crate::sched::thread::ThreadId;
use crate::signal::{ContextId, ReceiverId};
use crate::vm::VmId;
use alloc::vec::Vec;

/// Globally unique kernel-object identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub(crate) u64);

impl ObjectId {
    /// Raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ObjectId({})", self.0)
    }
}

/// The concrete resource behind a kernel object.
///
/// The discriminant replaces runtime downcasts: asking for the wrong
/// variant is a checked error, never undefined behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectPayload {
    /// Execution context.
    Thread(ThreadId),
    /// Protection domain.
    Pd(PdId),
    /// Signal receiver.
    SignalReceiver(ReceiverId),
    /// Signal context.
    SignalContext(ContextId),
    /// Interrupt line.
    Irq(IrqId),
    /// Virtual machine.
    Vm(VmId),
}

impl ObjectPayload {
    /// Discriminant name, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Thread(_) => "thread",
            Self::Pd(_) => "pd",
            Self::SignalReceiver(_) => "signal-receiver",
            Self::SignalContext(_) => "signal-context",
            Self::Irq(_) => "irq",
            Self::Vm(_) => "vm",
        }
    }

    /// The thread behind this object, if it is one.
    pub fn as_thread(&self) -> Result<ThreadId, CapError> {
        match self {
            Self::Thread(id) => Ok(*id),
            _ => Err(CapError::CannotCastToType),
        }
    }

    /// The protection domain behind this object, if it is one.
    pub fn as_pd(&self) -> Result<PdId, CapError> {
        match self {
            Self::Pd(id) => Ok(*id),
            _ => Err(CapError::CannotCastToType),
        }
    }

    /// The signal receiver behind this object, if it is one.
    pub fn as_signal_receiver(&self) -> Result<ReceiverId, CapError> {
        match self {
            Self::SignalReceiver(id) => Ok(*id),
            _ => Err(CapError::CannotCastToType),
        }
    }

    /// The signal context behind this object, if it is one.
    pub fn as_signal_context(&self) -> Result<ContextId, CapError> {
        match self {
            Self::SignalContext(id) => Ok(*id),
            _ => Err(CapError::CannotCastToType),
        }
    }

    /// The IRQ behind this object, if it is one.
    pub fn as_irq(&self) -> Result<IrqId, CapError> {
        match self {
            Self::Irq(id) => Ok(*id),
            _ => Err(CapError::CannotCastToType),
        }
    }

    /// The virtual machine behind this object, if it is one.
    pub fn as_vm(&self) -> Result<VmId, CapError> {
        match self {
            Self::Vm(id) => Ok(*id),
            _ => Err(CapError::CannotCastToType),
        }
    }
}

/// A kernel object: one payload, any number of identities.
///
/// The identity list is the set of names under which the object is
/// currently exported. Destroying the object invalidates every identity
/// first; the reverse order would leave capabilities pointing at freed
/// state.
pub struct KernelObject {
    pub(crate) id: ObjectId,
    pub(crate) payload: ObjectPayload,
    pub(crate) identities: Vec<IdentityId>,
}

impl KernelObject {
    pub(crate) fn new(id: ObjectId, payload: ObjectPayload) -> Self {
        Self {
            id,
            payload,
            identities: Vec::new(),
        }
    }

    /// Object id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Tagged payload.
    pub fn payload(&self) -> ObjectPayload {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_access_matches_tag() {
        let payload = ObjectPayload::Thread(ThreadId(7));
        assert_eq!(payload.as_thread(), Ok(ThreadId(7)));
        assert_eq!(payload.as_pd(), Err(CapError::CannotCastToType));
        assert_eq!(payload.as_signal_receiver(), Err(CapError::CannotCastToType));
    }

    #[test]
    fn type_names() {
        assert_eq!(ObjectPayload::Vm(VmId(1)).type_name(), "vm");
        assert_eq!(ObjectPayload::Irq(IrqId(4)).type_name(), "irq");
    }
}
