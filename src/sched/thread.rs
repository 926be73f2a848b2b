//! Threads
//!
//! A thread is the schedulable execution context of a protection domain.
//! Its lifecycle is a small state machine: constructed dormant, started
//! exactly once, then alternating between `Active` and one of the wait
//! states until it stops or is destroyed.
//!
//! Pausing is orthogonal to the wait states. A paused thread keeps the
//! reason it was blocked; if the blocking condition resolves while paused,
//! the wakeup is latched (`wake_pending`) and applied on resume. This way
//! a debugger can freeze and thaw a thread without ever losing a signal or
//! an IPC reply.

use super::{Priority, SchedError, ScheduleId};
use crate::cap::{ObjectId, ObjectPayload};
use crate::ipc::utcb::Utcb;
use crate::ipc::IpcState;
use crate::pd::PdId;
use crate::signal::{ContextId, ReceiverId};
use crate::Kernel;
use alloc::collections::BTreeMap;

/// Thread identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub(crate) u64);

impl ThreadId {
    /// Raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Lifecycle state of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Constructed but never started.
    AwaitsStart,
    /// Runnable (possibly paused).
    Active,
    /// Blocked in a message exchange.
    AwaitsIpc,
    /// Blocked until explicitly resumed, e.g. after a fault.
    AwaitsResume,
    /// Blocked on a signal receiver.
    AwaitsSignal,
    /// Blocked until an in-flight signal context can be destroyed.
    AwaitsSignalContextKill,
    /// Terminated; only destruction applies.
    Stopped,
}

/// An unresolved memory fault, kept for the pager.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fault {
    /// Faulting virtual address.
    pub addr: u64,
    /// Whether the faulting access was a write.
    pub writes: bool,
}

/// Kernel-side thread state.
pub struct Thread {
    id: ThreadId,
    object: ObjectId,
    pd: PdId,
    cpu: usize,
    priority: Priority,
    pub(crate) state: ThreadState,
    pub(crate) paused: bool,
    pub(crate) wake_pending: bool,
    pub(crate) utcb: Utcb,
    pub(crate) fault: Option<Fault>,
    pub(crate) fault_handler: Option<ContextId>,
    pub(crate) pager: Option<ThreadId>,
    /// Receiver this thread is blocked on while `AwaitsSignal`.
    pub(crate) awaited_receiver: Option<ReceiverId>,
    /// Context this thread is waiting to destroy, while
    /// `AwaitsSignalContextKill`.
    pub(crate) kill_target: Option<ContextId>,
    pub(crate) ipc: IpcState,
}

impl Thread {
    /// Thread id.
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Owning protection domain.
    pub fn pd(&self) -> PdId {
        self.pd
    }

    /// CPU this thread is affine to.
    pub fn cpu(&self) -> usize {
        self.cpu
    }

    /// Scheduling priority.
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Pager responsible for this thread's faults, if registered.
    pub fn pager(&self) -> Option<ThreadId> {
        self.pager
    }

    fn schedule_id(&self) -> ScheduleId {
        ScheduleId::Thread(self.id.0)
    }
}

/// Thread operations on the kernel facade.
impl Kernel {
    /// Create a dormant thread in `pd`, affine to `cpu`.
    pub fn new_thread(
        &self,
        pd: PdId,
        priority: Priority,
        cpu: usize,
    ) -> Result<ThreadId, SchedError> {
        if cpu >= self.cpus.len() {
            return Err(SchedError::InvalidCpu);
        }
        if priority as usize >= super::PRIORITY_LEVELS {
            return Err(SchedError::InvalidPriority);
        }
        let id = ThreadId(self.ids.next_thread());
        let object = self.caps.new_object(ObjectPayload::Thread(id));
        let thread = Thread {
            id,
            object,
            pd,
            cpu,
            priority,
            state: ThreadState::AwaitsStart,
            paused: false,
            wake_pending: false,
            utcb: Utcb::new(),
            fault: None,
            fault_handler: None,
            pager: None,
            awaited_receiver: None,
            kill_target: None,
            ipc: IpcState::new(),
        };
        self.cpus[cpu].lock().insert(thread.schedule_id(), priority)?;
        self.threads.write().insert(id, thread);
        Ok(id)
    }

    /// Start a dormant thread.
    pub fn start_thread(&self, id: ThreadId) -> Result<(), SchedError> {
        let mut threads = self.threads.write();
        let thread = threads.get_mut(&id).ok_or(SchedError::UnknownSubject)?;
        if thread.state != ThreadState::AwaitsStart {
            return Err(SchedError::InvalidState);
        }
        self.make_ready(thread);
        Ok(())
    }

    /// Freeze a thread without disturbing what it is blocked on.
    pub fn pause_thread(&self, id: ThreadId) -> Result<(), SchedError> {
        let mut threads = self.threads.write();
        let thread = threads.get_mut(&id).ok_or(SchedError::UnknownSubject)?;
        if thread.paused {
            return Ok(());
        }
        thread.paused = true;
        self.make_unready(thread);
        Ok(())
    }

    /// Thaw a paused thread, applying any wakeup latched while frozen.
    ///
    /// A thread explicitly blocked in `AwaitsResume` is unblocked as well;
    /// all other wait states persist until their condition resolves.
    pub fn resume_thread(&self, id: ThreadId) -> Result<(), SchedError> {
        let mut threads = self.threads.write();
        let thread = threads.get_mut(&id).ok_or(SchedError::UnknownSubject)?;
        thread.paused = false;
        if thread.state == ThreadState::AwaitsResume {
            thread.wake_pending = false;
            self.make_ready(thread);
            return Ok(());
        }
        if thread.wake_pending || thread.state == ThreadState::Active {
            thread.wake_pending = false;
            self.make_ready(thread);
        }
        Ok(())
    }

    /// Terminate a thread. It keeps its kernel object until destroyed,
    /// but is detached from everything it was blocked on so that no
    /// delivery or request is ever routed to a corpse.
    pub fn stop_thread(&self, id: ThreadId) -> Result<(), SchedError> {
        let (cancel, awaited, own_pd, reclaim) = {
            let mut threads = self.threads.write();
            if !threads.contains_key(&id) {
                return Err(SchedError::UnknownSubject);
            }
            let reclaim = Kernel::take_unsent_caps(&mut threads, id);
            let thread = threads.get_mut(&id).ok_or(SchedError::UnknownSubject)?;
            thread.state = ThreadState::Stopped;
            self.make_unready(thread);
            let awaited = thread.awaited_receiver.take();
            let own_pd = thread.pd();
            let cancel = self.collect_ipc_peers(&mut threads, id);
            (cancel, awaited, own_pd, reclaim)
        };
        self.cancel_peers(&cancel, own_pd);
        if let Some(receiver) = awaited {
            self.forget_signal_waiter(receiver, id);
        }
        if let Some((pd, caps)) = reclaim {
            self.reclaim_transferred_caps(pd, &caps);
        }
        Ok(())
    }

    /// Destroy a thread: cancel its IPC partners, detach it from signal
    /// receivers and invalidate every capability referring to it.
    pub fn destroy_thread(&self, id: ThreadId) -> Result<(), SchedError> {
        let (thread, cancel, reclaim) = {
            let mut threads = self.threads.write();
            if !threads.contains_key(&id) {
                return Err(SchedError::UnknownSubject);
            }
            let reclaim = Kernel::take_unsent_caps(&mut threads, id);
            let cancel = self.collect_ipc_peers(&mut threads, id);
            (
                threads.remove(&id).ok_or(SchedError::UnknownSubject)?,
                cancel,
                reclaim,
            )
        };
        self.cpus[thread.cpu].lock().remove(thread.schedule_id());
        self.cancel_peers(&cancel, thread.pd);
        if let Some(receiver) = thread.awaited_receiver {
            self.forget_signal_waiter(receiver, id);
        }
        if let Some((pd, caps)) = reclaim {
            self.reclaim_transferred_caps(pd, &caps);
        }
        if self.caps.destroy_object(thread.object).is_err() {
            log::warn!("thread {:?} had no backing object", id);
        }
        Ok(())
    }

    /// Record a memory fault and hand it to the fault handler.
    ///
    /// The thread blocks in `AwaitsResume` until its pager fixed the
    /// mapping and resumes it. Without a registered handler the fault is
    /// unrecoverable and the thread stops.
    pub fn handle_fault(&self, id: ThreadId, addr: u64, writes: bool) -> Result<(), SchedError> {
        let handler = {
            let mut threads = self.threads.write();
            let thread = threads.get_mut(&id).ok_or(SchedError::UnknownSubject)?;
            thread.fault = Some(Fault { addr, writes });
            match thread.fault_handler {
                Some(ctx) => {
                    thread.state = ThreadState::AwaitsResume;
                    self.make_unready(thread);
                    Some(ctx)
                }
                None => {
                    log::error!(
                        "unresolvable fault at {:#x} in thread {:?}, stopping it",
                        addr,
                        id
                    );
                    thread.state = ThreadState::Stopped;
                    self.make_unready(thread);
                    None
                }
            }
        };
        if let Some(ctx) = handler {
            if self.submit_to_context(ctx, 1).is_err() {
                log::warn!("fault handler context of thread {:?} is gone", id);
            }
        }
        Ok(())
    }

    /// Fault recorded for a thread, consumed by the pager.
    pub fn take_fault(&self, id: ThreadId) -> Result<Option<Fault>, SchedError> {
        self.with_thread(id, |t| t.fault.take())
    }

    /// Register the signal context that receives this thread's faults.
    pub fn set_fault_handler(&self, id: ThreadId, ctx: ContextId) -> Result<(), SchedError> {
        self.with_thread(id, |t| t.fault_handler = Some(ctx))
    }

    /// Register the pager thread responsible for this thread.
    pub fn set_pager(&self, id: ThreadId, pager: ThreadId) -> Result<(), SchedError> {
        self.with_thread(id, |t| t.pager = Some(pager))
    }

    /// Lifecycle state of a thread.
    pub fn thread_state(&self, id: ThreadId) -> Result<ThreadState, SchedError> {
        self.threads
            .read()
            .get(&id)
            .map(|t| t.state)
            .ok_or(SchedError::UnknownSubject)
    }

    /// Kernel object backing a thread.
    pub fn thread_object(&self, id: ThreadId) -> Option<ObjectId> {
        self.threads.read().get(&id).map(|t| t.object)
    }

    /// Subject currently dispatched on `cpu`.
    pub fn current(&self, cpu: usize) -> Result<Option<ScheduleId>, SchedError> {
        let sched = self.cpus.get(cpu).ok_or(SchedError::InvalidCpu)?;
        Ok(sched.lock().current())
    }

    /// Timer tick: the current subject's quantum is used up.
    pub fn handle_quantum_expiry(&self, cpu: usize) -> Result<Option<ScheduleId>, SchedError> {
        let sched = self.cpus.get(cpu).ok_or(SchedError::InvalidCpu)?;
        Ok(sched.lock().quantum_expired())
    }

    /// The current subject on `cpu` donates the rest of its quantum.
    pub fn yield_cpu(&self, cpu: usize) -> Result<Option<ScheduleId>, SchedError> {
        let sched = self.cpus.get(cpu).ok_or(SchedError::InvalidCpu)?;
        Ok(sched.lock().yield_current())
    }

    /// Mark a thread runnable, honoring the pause latch.
    ///
    /// Caller holds the thread table lock.
    pub(crate) fn make_ready(&self, thread: &mut Thread) {
        thread.state = ThreadState::Active;
        if thread.paused {
            thread.wake_pending = true;
            return;
        }
        let mut sched = self.cpus[thread.cpu].lock();
        sched.ready(thread.schedule_id());
        sched.schedule();
    }

    /// Take a thread out of contention on its CPU.
    ///
    /// Caller holds the thread table lock.
    pub(crate) fn make_unready(&self, thread: &Thread) {
        let mut sched = self.cpus[thread.cpu].lock();
        sched.unready(thread.schedule_id());
        sched.schedule();
    }

    pub(crate) fn with_thread<R>(
        &self,
        id: ThreadId,
        f: impl FnOnce(&mut Thread) -> R,
    ) -> Result<R, SchedError> {
        let mut threads = self.threads.write();
        let thread = threads.get_mut(&id).ok_or(SchedError::UnknownSubject)?;
        Ok(f(thread))
    }

    fn collect_ipc_peers(
        &self,
        threads: &mut BTreeMap<ThreadId, Thread>,
        id: ThreadId,
    ) -> alloc::vec::Vec<ThreadId> {
        let Some(thread) = threads.get_mut(&id) else {
            return alloc::vec::Vec::new();
        };
        let mut peers: alloc::vec::Vec<ThreadId> = thread.ipc.queue.drain(..).collect();
        if let Some(peer) = thread.ipc.peer() {
            peers.push(peer);
        }
        thread.ipc.reset();
        peers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Kernel;

    fn kernel() -> Kernel {
        Kernel::new(2)
    }

    #[test]
    fn thread_starts_dormant_and_runs_once_started() {
        let kernel = kernel();
        let pd = kernel.new_pd();
        let thread = kernel.new_thread(pd, 1, 0).unwrap();

        assert_eq!(kernel.thread_state(thread), Ok(ThreadState::AwaitsStart));
        assert_eq!(kernel.current(0), Ok(None));

        kernel.start_thread(thread).unwrap();
        assert_eq!(kernel.thread_state(thread), Ok(ThreadState::Active));
        assert_eq!(
            kernel.current(0),
            Ok(Some(ScheduleId::Thread(thread.raw())))
        );
    }

    #[test]
    fn starting_twice_is_refused() {
        let kernel = kernel();
        let pd = kernel.new_pd();
        let thread = kernel.new_thread(pd, 1, 0).unwrap();
        kernel.start_thread(thread).unwrap();
        assert_eq!(kernel.start_thread(thread), Err(SchedError::InvalidState));
    }

    #[test]
    fn invalid_cpu_is_rejected() {
        let kernel = kernel();
        let pd = kernel.new_pd();
        assert_eq!(kernel.new_thread(pd, 1, 9), Err(SchedError::InvalidCpu));
    }

    #[test]
    fn pause_removes_from_cpu_and_resume_restores() {
        let kernel = kernel();
        let pd = kernel.new_pd();
        let thread = kernel.new_thread(pd, 1, 0).unwrap();
        kernel.start_thread(thread).unwrap();

        kernel.pause_thread(thread).unwrap();
        assert_eq!(kernel.current(0), Ok(None));
        // The thread is still Active, just frozen.
        assert_eq!(kernel.thread_state(thread), Ok(ThreadState::Active));

        kernel.resume_thread(thread).unwrap();
        assert_eq!(
            kernel.current(0),
            Ok(Some(ScheduleId::Thread(thread.raw())))
        );
    }

    #[test]
    fn wakeup_while_paused_is_latched() {
        let kernel = kernel();
        let pd = kernel.new_pd();
        let thread = kernel.new_thread(pd, 1, 0).unwrap();
        kernel.start_thread(thread).unwrap();
        kernel.pause_thread(thread).unwrap();

        // A wakeup arriving while frozen must not schedule the thread.
        kernel
            .with_thread(thread, |t| {
                t.state = ThreadState::AwaitsResume;
            })
            .unwrap();
        kernel
            .with_thread(thread, |t| kernel.make_ready(t))
            .unwrap();
        assert_eq!(kernel.current(0), Ok(None));
        assert_eq!(kernel.thread_state(thread), Ok(ThreadState::Active));

        kernel.resume_thread(thread).unwrap();
        assert_eq!(
            kernel.current(0),
            Ok(Some(ScheduleId::Thread(thread.raw())))
        );
    }

    #[test]
    fn fault_without_handler_stops_the_thread() {
        let kernel = kernel();
        let pd = kernel.new_pd();
        let thread = kernel.new_thread(pd, 1, 0).unwrap();
        kernel.start_thread(thread).unwrap();

        kernel.handle_fault(thread, 0xdead_b000, true).unwrap();
        assert_eq!(kernel.thread_state(thread), Ok(ThreadState::Stopped));
        assert_eq!(kernel.current(0), Ok(None));
    }

    #[test]
    fn fault_with_handler_blocks_until_resume() {
        let kernel = kernel();
        let pd = kernel.new_pd();
        let thread = kernel.new_thread(pd, 1, 0).unwrap();
        let receiver = kernel.new_receiver();
        let ctx = kernel.new_context(0x77);
        kernel.manage_context(receiver, ctx).unwrap();
        kernel.set_fault_handler(thread, ctx).unwrap();
        kernel.start_thread(thread).unwrap();

        kernel.handle_fault(thread, 0x4000, false).unwrap();
        assert_eq!(kernel.thread_state(thread), Ok(ThreadState::AwaitsResume));
        assert_eq!(kernel.current(0), Ok(None));

        // The pager reads the fault and resumes the thread.
        let fault = kernel.take_fault(thread).unwrap().unwrap();
        assert_eq!(fault.addr, 0x4000);
        assert!(!fault.writes);
        kernel.resume_thread(thread).unwrap();
        assert_eq!(kernel.thread_state(thread), Ok(ThreadState::Active));
        assert_eq!(
            kernel.current(0),
            Ok(Some(ScheduleId::Thread(thread.raw())))
        );
    }

    #[test]
    fn destroy_removes_thread_and_invalidates_caps() {
        let kernel = kernel();
        let pd = kernel.new_pd();
        let thread = kernel.new_thread(pd, 1, 0).unwrap();
        let object = kernel.thread_object(thread).unwrap();
        let capid = kernel.publish(object, pd).unwrap();
        kernel.start_thread(thread).unwrap();

        kernel.destroy_thread(thread).unwrap();
        assert_eq!(kernel.thread_state(thread), Err(SchedError::UnknownSubject));
        assert_eq!(kernel.current(0), Ok(None));
        assert!(kernel.object_of(pd, capid).is_none());
        assert!(kernel.find_cap(pd, capid).is_some());
    }

    #[test]
    fn threads_spread_over_cpus() {
        let kernel = kernel();
        let pd = kernel.new_pd();
        let t0 = kernel.new_thread(pd, 1, 0).unwrap();
        let t1 = kernel.new_thread(pd, 1, 1).unwrap();
        kernel.start_thread(t0).unwrap();
        kernel.start_thread(t1).unwrap();

        assert_eq!(kernel.current(0), Ok(Some(ScheduleId::Thread(t0.raw()))));
        assert_eq!(kernel.current(1), Ok(Some(ScheduleId::Thread(t1.raw()))));
    }
}
