//! # Erebus Kernel
//!
//! Core object and capability layer of a capability-based microkernel:
//! kernel objects with revocable identities, per-PD capability trees,
//! fixed-priority scheduling, synchronous IPC with badge translation and
//! asynchronous signals.
//!
//! ## Architecture
//!
//! All state hangs off one [`Kernel`] value; there are no globals. User
//! code never sees kernel pointers, only badges that resolve through its
//! own protection domain:
//!
//! ```text
//!                 +-----------+
//!  Badge -------> | PD tree   | ---> identity ---> kernel object
//!                 +-----------+        |
//!                                      +--> invalidated: still findable,
//!                                           resolves to nothing
//! ```
//!
//! - [`cap`]: badges, objects, identities, delegation and revocation
//! - [`pd`]: protection domains and their capability trees
//! - [`sched`]: per-CPU fixed-priority round-robin scheduling, threads
//! - [`ipc`]: synchronous request/reply with capability transfer
//! - [`signal`]: asynchronous, coalescing signal delivery
//! - [`irq`]: user-level interrupt handling on top of signals
//! - [`vm`]: virtual machines as schedulable subjects
//!
//! The crate is `no_std` + `alloc`; hosted builds (tests) link `std`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod cap;
pub mod ipc;
pub mod irq;
pub mod pd;
pub mod sched;
pub mod signal;
pub mod sync;
pub mod vm;

pub use cap::{Badge, CapError, CapStore, IdentityId, ObjectId, ObjectPayload};
pub use ipc::{IpcError, IpcPhase};
pub use irq::{IrqError, IrqId, IrqMode};
pub use pd::{Pd, PdId};
pub use sched::thread::{Fault, Thread, ThreadId, ThreadState};
pub use sched::{CpuScheduler, Priority, SchedError, ScheduleId, PRIORITY_LEVELS};
pub use signal::{ContextId, ReceiverId, Signal, SignalError};
pub use vm::VmId;

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use irq::UserIrq;
use signal::{SignalContext, SignalReceiver};
use sync::{SchedulerLock, TableLock};
use vm::Vm;

/// Monotonic id sources for every object class.
pub(crate) struct IdGen {
    pd: AtomicU64,
    thread: AtomicU64,
    receiver: AtomicU64,
    context: AtomicU64,
    vm: AtomicU64,
}

impl IdGen {
    fn new() -> Self {
        Self {
            pd: AtomicU64::new(1),
            thread: AtomicU64::new(1),
            receiver: AtomicU64::new(1),
            context: AtomicU64::new(1),
            vm: AtomicU64::new(1),
        }
    }

    fn next_pd(&self) -> u64 {
        self.pd.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_thread(&self) -> u64 {
        self.thread.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_receiver(&self) -> u64 {
        self.receiver.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_context(&self) -> u64 {
        self.context.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_vm(&self) -> u64 {
        self.vm.fetch_add(1, Ordering::Relaxed)
    }
}

/// The kernel: every object table, the capability store and one scheduler
/// per CPU.
///
/// All operations take `&self`; interior locks follow the discipline laid
/// out in [`sync`].
pub struct Kernel {
    pub(crate) caps: CapStore,
    pub(crate) pds: TableLock<BTreeMap<PdId, Pd>>,
    pub(crate) threads: TableLock<BTreeMap<ThreadId, Thread>>,
    pub(crate) receivers: TableLock<BTreeMap<ReceiverId, SignalReceiver>>,
    pub(crate) contexts: TableLock<BTreeMap<ContextId, SignalContext>>,
    pub(crate) irqs: TableLock<BTreeMap<IrqId, UserIrq>>,
    pub(crate) vms: TableLock<BTreeMap<VmId, Vm>>,
    pub(crate) cpus: Vec<SchedulerLock<CpuScheduler>>,
    pub(crate) ids: IdGen,
}

impl Kernel {
    /// Create a kernel managing `cpu_count` CPUs (at least one).
    pub fn new(cpu_count: usize) -> Self {
        let cpus = (0..cpu_count.max(1))
            .map(|_| SchedulerLock::new(CpuScheduler::new()))
            .collect();
        Self {
            caps: CapStore::new(cap::DEFAULT_BADGE_CAPACITY),
            pds: TableLock::new(BTreeMap::new()),
            threads: TableLock::new(BTreeMap::new()),
            receivers: TableLock::new(BTreeMap::new()),
            contexts: TableLock::new(BTreeMap::new()),
            irqs: TableLock::new(BTreeMap::new()),
            vms: TableLock::new(BTreeMap::new()),
            cpus,
            ids: IdGen::new(),
        }
    }

    /// Number of CPUs under management.
    pub fn cpu_count(&self) -> usize {
        self.cpus.len()
    }

    /// Create an empty protection domain.
    pub fn new_pd(&self) -> PdId {
        let id = PdId(self.ids.next_pd());
        let object = self.caps.new_object(ObjectPayload::Pd(id));
        self.pds.write().insert(id, Pd::new(id, object));
        id
    }

    /// Kernel object backing a protection domain.
    pub fn pd_object(&self, id: PdId) -> Option<ObjectId> {
        self.pds.read().get(&id).map(|pd| pd.object)
    }

    /// Number of capabilities a protection domain currently holds.
    pub fn pd_cap_count(&self, id: PdId) -> Option<usize> {
        self.pds.read().get(&id).map(|pd| pd.cap_count())
    }

    /// Destroy a protection domain: return every badge it holds to the
    /// allocator and invalidate capabilities referring to the PD itself.
    ///
    /// Threads of the PD must be destroyed beforehand; references they
    /// delegated to other PDs are unaffected.
    pub fn destroy_pd(&self, id: PdId) -> Result<(), CapError> {
        let pd = self.pds.write().remove(&id).ok_or(CapError::UnknownPd)?;
        let tree = core::mem::take(&mut *pd.tree.lock());
        for (badge, oir) in tree {
            self.caps.unrecord_ref(oir.identity(), id, badge);
            self.caps.badges.free(badge);
        }
        self.caps.destroy_object(pd.object)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The full life of a service capability: created, published, handed
    /// to a client, invoked, invalidated by destruction, revoked, and the
    /// badge recycled.
    #[test]
    fn capability_lifecycle_end_to_end() {
        let kernel = Kernel::new(1);
        let server_pd = kernel.new_pd();
        let client_pd = kernel.new_pd();
        let server = kernel.new_thread(server_pd, 2, 0).unwrap();
        let client = kernel.new_thread(client_pd, 1, 0).unwrap();
        kernel.start_thread(server).unwrap();
        kernel.start_thread(client).unwrap();

        // Publish the server's thread object and hand a capability to the
        // client.
        let object = kernel.thread_object(server).unwrap();
        let server_name = kernel.publish(object, server_pd).unwrap();
        let session = kernel.delegate(server_pd, server_name, client_pd).unwrap();

        // The client invokes the session and the server answers.
        kernel.await_request(server).unwrap();
        kernel.utcb_write(client, b"open").unwrap();
        kernel.send_request(client, session).unwrap();
        assert_eq!(kernel.utcb_badge(server).unwrap(), server_name.raw());
        kernel.utcb_write(server, b"ok").unwrap();
        kernel.send_reply(server).unwrap();
        assert_eq!(kernel.utcb_read(client).unwrap(), b"ok");

        // Destroying the server invalidates both references at once.
        kernel.destroy_thread(server).unwrap();
        assert!(kernel.object_of(client_pd, session).is_none());
        assert!(kernel.object_of(server_pd, server_name).is_none());
        assert_eq!(
            kernel.send_request(client, session),
            Err(IpcError::UnknownCapability)
        );

        // Revocation returns the badges for reuse.
        kernel.revoke(client_pd, session).unwrap();
        kernel.revoke(server_pd, server_name).unwrap();
        let recycled = kernel
            .publish(kernel.thread_object(client).unwrap(), server_pd)
            .unwrap();
        assert_eq!(recycled, server_name);
    }

    /// A fault travels as a signal to a pager thread, which resolves it
    /// and resumes the faulter.
    #[test]
    fn fault_handling_via_pager() {
        let kernel = Kernel::new(1);
        let pd = kernel.new_pd();
        let faulter = kernel.new_thread(pd, 1, 0).unwrap();
        let pager = kernel.new_thread(pd, 2, 0).unwrap();
        let receiver = kernel.new_receiver();
        let ctx = kernel.new_context(faulter.raw());
        kernel.manage_context(receiver, ctx).unwrap();
        kernel.set_fault_handler(faulter, ctx).unwrap();
        kernel.set_pager(faulter, pager).unwrap();
        kernel.start_thread(faulter).unwrap();
        kernel.start_thread(pager).unwrap();

        kernel.await_signal(pager, receiver).unwrap();
        kernel.handle_fault(faulter, 0x1000, true).unwrap();

        // The pager woke up with the faulter's imprint.
        assert_eq!(kernel.thread_state(pager), Ok(ThreadState::Active));
        let signal = kernel.delivered_signal(pager).unwrap();
        assert_eq!(signal.imprint, faulter.raw());

        let fault = kernel.take_fault(faulter).unwrap().unwrap();
        assert_eq!(fault.addr, 0x1000);
        kernel.ack_context(ctx).unwrap();
        kernel.resume_thread(faulter).unwrap();
        assert_eq!(kernel.thread_state(faulter), Ok(ThreadState::Active));
    }

    /// A signal wakeup of a high-priority thread preempts the running
    /// low-priority one immediately.
    #[test]
    fn signal_wakeup_preempts_lower_priority() {
        let kernel = Kernel::new(1);
        let pd = kernel.new_pd();
        let low = kernel.new_thread(pd, 0, 0).unwrap();
        let high = kernel.new_thread(pd, 3, 0).unwrap();
        let receiver = kernel.new_receiver();
        let ctx = kernel.new_context(1);
        kernel.manage_context(receiver, ctx).unwrap();
        kernel.start_thread(low).unwrap();
        kernel.start_thread(high).unwrap();

        kernel.await_signal(high, receiver).unwrap();
        assert_eq!(kernel.current(0), Ok(Some(ScheduleId::Thread(low.raw()))));

        kernel.submit_to_context(ctx, 1).unwrap();
        assert_eq!(kernel.current(0), Ok(Some(ScheduleId::Thread(high.raw()))));

        // When the high thread blocks again, the low one takes over.
        kernel.ack_context(ctx).unwrap();
        kernel.await_signal(high, receiver).unwrap();
        assert_eq!(kernel.current(0), Ok(Some(ScheduleId::Thread(low.raw()))));
    }

    #[test]
    fn destroying_a_pd_returns_its_badges() {
        let kernel = Kernel::new(1);
        let keeper_pd = kernel.new_pd();
        let victim_pd = kernel.new_pd();
        let thread = kernel.new_thread(keeper_pd, 1, 0).unwrap();
        let object = kernel.thread_object(thread).unwrap();

        let kept = kernel.publish(object, keeper_pd).unwrap();
        let doomed: alloc::vec::Vec<Badge> = (0..3)
            .map(|_| kernel.publish(object, victim_pd).unwrap())
            .collect();
        assert_eq!(kernel.pd_cap_count(victim_pd), Some(3));

        kernel.destroy_pd(victim_pd).unwrap();
        assert_eq!(kernel.pd_cap_count(victim_pd), None);
        // The surviving reference still resolves.
        assert_eq!(kernel.object_of(keeper_pd, kept), Some(object));

        // Freed badges come back, lowest first.
        let recycled = kernel.publish(object, keeper_pd).unwrap();
        assert_eq!(recycled, doomed[0]);
    }

    #[test]
    fn pd_capabilities_can_be_published_and_invalidate_on_destroy() {
        let kernel = Kernel::new(1);
        let holder = kernel.new_pd();
        let target = kernel.new_pd();
        let object = kernel.pd_object(target).unwrap();
        let capid = kernel.publish(object, holder).unwrap();

        assert_eq!(
            kernel.payload_of(holder, capid).unwrap().as_pd(),
            Ok(target)
        );
        kernel.destroy_pd(target).unwrap();
        assert!(kernel.object_of(holder, capid).is_none());
    }
}
