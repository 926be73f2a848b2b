//! Virtual machines
//!
//! A virtual machine is the second kind of schedulable subject besides
//! threads. The kernel only multiplexes it onto a CPU; world switches and
//! guest state live with the virtualization layer. VM exits pause the
//! subject and signal the monitor's exit context, which inspects the
//! guest and runs it again.

use crate::cap::{ObjectId, ObjectPayload};
use crate::sched::{Priority, SchedError, ScheduleId};
use crate::signal::ContextId;
use crate::Kernel;

/// Virtual-machine identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmId(pub(crate) u64);

impl VmId {
    /// Raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Kernel-side virtual-machine state.
pub struct Vm {
    object: ObjectId,
    cpu: usize,
    /// Signaled on every VM exit.
    exit_context: ContextId,
    running: bool,
}

impl Vm {
    /// Whether the machine is in contention for its CPU.
    pub fn is_running(&self) -> bool {
        self.running
    }
}

/// VM operations on the kernel facade.
impl Kernel {
    /// Create a paused virtual machine on `cpu`, reporting exits to
    /// `exit_context`.
    pub fn new_vm(
        &self,
        cpu: usize,
        priority: Priority,
        exit_context: ContextId,
    ) -> Result<VmId, SchedError> {
        if cpu >= self.cpus.len() {
            return Err(SchedError::InvalidCpu);
        }
        let id = VmId(self.ids.next_vm());
        let object = self.caps.new_object(ObjectPayload::Vm(id));
        self.cpus[cpu].lock().insert(ScheduleId::Vm(id.0), priority)?;
        self.vms.write().insert(
            id,
            Vm {
                object,
                cpu,
                exit_context,
                running: false,
            },
        );
        Ok(id)
    }

    /// Put a virtual machine into contention for its CPU.
    pub fn run_vm(&self, id: VmId) -> Result<(), SchedError> {
        let cpu = {
            let mut vms = self.vms.write();
            let vm = vms.get_mut(&id).ok_or(SchedError::UnknownSubject)?;
            vm.running = true;
            vm.cpu
        };
        let mut sched = self.cpus[cpu].lock();
        sched.ready(ScheduleId::Vm(id.0));
        sched.schedule();
        Ok(())
    }

    /// Take a virtual machine off its CPU.
    pub fn pause_vm(&self, id: VmId) -> Result<(), SchedError> {
        let cpu = {
            let mut vms = self.vms.write();
            let vm = vms.get_mut(&id).ok_or(SchedError::UnknownSubject)?;
            vm.running = false;
            vm.cpu
        };
        let mut sched = self.cpus[cpu].lock();
        sched.unready(ScheduleId::Vm(id.0));
        sched.schedule();
        Ok(())
    }

    /// Guest left the VM: pause it and signal the monitor.
    pub fn vm_exit(&self, id: VmId) -> Result<(), SchedError> {
        self.pause_vm(id)?;
        let ctx = {
            let vms = self.vms.read();
            vms.get(&id).ok_or(SchedError::UnknownSubject)?.exit_context
        };
        if self.submit_to_context(ctx, 1).is_err() {
            log::warn!("vm {:?} exited into a dead monitor context", id);
        }
        Ok(())
    }

    /// Destroy a virtual machine, invalidating capabilities referring to
    /// it.
    pub fn destroy_vm(&self, id: VmId) -> Result<(), SchedError> {
        let vm = self
            .vms
            .write()
            .remove(&id)
            .ok_or(SchedError::UnknownSubject)?;
        self.cpus[vm.cpu].lock().remove(ScheduleId::Vm(id.0));
        if self.caps.destroy_object(vm.object).is_err() {
            log::warn!("vm {:?} had no backing object", id);
        }
        Ok(())
    }

    /// Kernel object backing a virtual machine.
    pub fn vm_object(&self, id: VmId) -> Option<ObjectId> {
        self.vms.read().get(&id).map(|v| v.object)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Kernel;

    fn setup() -> (Kernel, crate::signal::ReceiverId, ContextId) {
        let kernel = Kernel::new(1);
        let rid = kernel.new_receiver();
        let cid = kernel.new_context(0x7);
        kernel.manage_context(rid, cid).unwrap();
        (kernel, rid, cid)
    }

    #[test]
    fn vm_competes_with_threads_for_the_cpu() {
        let (kernel, _, cid) = setup();
        let pd = kernel.new_pd();
        let thread = kernel.new_thread(pd, 1, 0).unwrap();
        kernel.start_thread(thread).unwrap();

        let vm = kernel.new_vm(0, 1, cid).unwrap();
        kernel.run_vm(vm).unwrap();

        assert_eq!(
            kernel.current(0),
            Ok(Some(ScheduleId::Thread(thread.raw())))
        );
        assert_eq!(
            kernel.handle_quantum_expiry(0),
            Ok(Some(ScheduleId::Vm(vm.raw())))
        );

        kernel.pause_vm(vm).unwrap();
        assert_eq!(
            kernel.current(0),
            Ok(Some(ScheduleId::Thread(thread.raw())))
        );
    }

    #[test]
    fn exit_pauses_and_signals_the_monitor() {
        let (kernel, rid, cid) = setup();
        let vm = kernel.new_vm(0, 1, cid).unwrap();
        kernel.run_vm(vm).unwrap();
        assert_eq!(kernel.current(0), Ok(Some(ScheduleId::Vm(vm.raw()))));

        kernel.vm_exit(vm).unwrap();
        assert_eq!(kernel.current(0), Ok(None));
        assert_eq!(kernel.pending_signal(rid).unwrap().imprint, 0x7);
    }

    #[test]
    fn destroy_invalidates_vm_caps() {
        let (kernel, _, cid) = setup();
        let pd = kernel.new_pd();
        let vm = kernel.new_vm(0, 1, cid).unwrap();
        let object = kernel.vm_object(vm).unwrap();
        let capid = kernel.publish(object, pd).unwrap();
        kernel.run_vm(vm).unwrap();

        kernel.destroy_vm(vm).unwrap();
        assert_eq!(kernel.current(0), Ok(None));
        assert!(kernel.object_of(pd, capid).is_none());
        assert_eq!(kernel.run_vm(vm), Err(SchedError::UnknownSubject));
    }

    #[test]
    fn invalid_cpu_is_rejected() {
        let (kernel, _, cid) = setup();
        assert_eq!(kernel.new_vm(5, 1, cid), Err(SchedError::InvalidCpu));
    }
}
