//! # Synchronous IPC
//!
//! Client/server message passing with rendezvous semantics. A caller
//! invokes a thread capability and blocks until the reply; a server
//! fetches one request at a time and answers it. Callers that arrive
//! while the server is busy queue up FIFO.
//!
//! The receiver never learns who the sender is. Each request is stamped
//! with the badge under which the *invoked* capability's identity is
//! known in the receiver's own PD, or 0 if the receiver holds no such
//! capability. Capabilities attached to a request are delegated into the
//! receiver's PD on delivery and stay pinned against revocation until the
//! receiver acknowledges them.

pub mod utcb;

use crate::cap::{Badge, CapError};
use crate::sched::thread::{ThreadId, ThreadState};
use crate::Kernel;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// IPC errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// The payload exceeds the message-buffer capacity.
    PayloadTooLarge,
    /// More capabilities attached than a message can carry.
    TooManyCaps,
    /// No thread with the given id exists.
    UnknownThread,
    /// The invoked capability does not resolve to an object.
    UnknownCapability,
    /// The invoked capability names something other than a thread.
    NotAThread,
    /// The thread is not in a state that allows the operation.
    BadState,
    /// The blocking operation was canceled before completion.
    BlockingCanceled,
}

/// Where a thread stands in the request/reply protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcPhase {
    /// No exchange in progress.
    Idle,
    /// Server side, blocked until a request arrives.
    AwaitRequest,
    /// Caller side, blocked until `peer` replies.
    AwaitReply {
        /// The invoked server thread.
        peer: ThreadId,
    },
    /// Server side, holding a request from `caller` that awaits a reply.
    PrepareReply {
        /// The thread the reply goes to.
        caller: ThreadId,
    },
}

/// Per-thread IPC bookkeeping.
pub struct IpcState {
    pub(crate) phase: IpcPhase,
    /// Callers waiting for this thread to fetch a request, FIFO.
    pub(crate) queue: VecDeque<ThreadId>,
    /// Badge to stamp on this thread's queued request when it is fetched.
    pub(crate) send_badge: u64,
    /// Outcome of the last blocking exchange, set on wakeup.
    pub(crate) result: Option<Result<(), IpcError>>,
}

impl IpcState {
    pub(crate) fn new() -> Self {
        Self {
            phase: IpcPhase::Idle,
            queue: VecDeque::new(),
            send_badge: 0,
            result: None,
        }
    }

    /// The thread this one is engaged with, if any.
    pub(crate) fn peer(&self) -> Option<ThreadId> {
        match self.phase {
            IpcPhase::AwaitReply { peer } => Some(peer),
            IpcPhase::PrepareReply { caller } => Some(caller),
            _ => None,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.phase = IpcPhase::Idle;
        self.queue.clear();
        self.send_badge = 0;
    }
}

/// IPC operations on the kernel facade.
impl Kernel {
    /// Invoke a thread capability with the payload staged in the caller's
    /// message buffer, blocking the caller until the reply.
    pub fn send_request(&self, caller: ThreadId, dst_cap: Badge) -> Result<(), IpcError> {
        let caller_pd = {
            let threads = self.threads.read();
            let t = threads.get(&caller).ok_or(IpcError::UnknownThread)?;
            if t.state != ThreadState::Active {
                return Err(IpcError::BadState);
            }
            t.pd()
        };

        let oir = self
            .find_cap(caller_pd, dst_cap)
            .ok_or(IpcError::UnknownCapability)?;
        let object = self
            .caps
            .identity_object(oir.identity())
            .ok_or(IpcError::UnknownCapability)?;
        let dst = self
            .caps
            .payload(object)
            .map_err(|_| IpcError::UnknownCapability)?
            .as_thread()
            .map_err(|_| IpcError::NotAThread)?;
        if dst == caller {
            return Err(IpcError::BadState);
        }
        let dst_pd = {
            let threads = self.threads.read();
            threads.get(&dst).ok_or(IpcError::UnknownThread)?.pd()
        };

        // The receiver sees the name it already holds for the invoked
        // identity, not the caller's.
        let badge = self
            .translate(oir.identity(), dst_pd)
            .map(|b| b.raw())
            .unwrap_or(0);

        // Delegate attached capabilities into the receiver's PD up front;
        // delivery then only moves the already-translated badges. Each one
        // stays pinned until the receiver acknowledges it.
        let attached: Vec<Badge> = {
            let threads = self.threads.read();
            let t = threads.get(&caller).ok_or(IpcError::UnknownThread)?;
            t.utcb.caps().iter().copied().collect()
        };
        let mut translated: Vec<Badge> = Vec::new();
        for capid in attached {
            match self.delegate(caller_pd, capid, dst_pd) {
                Ok(new_cap) => {
                    if self.add_to_utcb(dst_pd, new_cap).is_err() {
                        log::warn!("failed to pin delegated badge {}", new_cap.raw());
                    }
                    translated.push(new_cap);
                }
                Err(e) => {
                    log::warn!("dropping untransferable capability {}: {:?}", capid.raw(), e)
                }
            }
        }

        let mut threads = self.threads.write();
        if !threads.contains_key(&dst) {
            return Err(IpcError::UnknownThread);
        }
        {
            let t = threads.get_mut(&caller).ok_or(IpcError::UnknownThread)?;
            let caps = t.utcb.take_caps();
            debug_assert!(caps.len() >= translated.len());
            for capid in &translated {
                t.utcb.put_cap(*capid);
            }
            t.ipc.send_badge = badge;
            t.ipc.phase = IpcPhase::AwaitReply { peer: dst };
            t.state = ThreadState::AwaitsIpc;
            self.make_unready(t);
        }
        let ready_to_receive = {
            let d = threads.get_mut(&dst).ok_or(IpcError::UnknownThread)?;
            d.state == ThreadState::AwaitsIpc && d.ipc.phase == IpcPhase::AwaitRequest
        };
        if ready_to_receive {
            self.hand_over(&mut threads, caller, dst);
        } else {
            let d = threads.get_mut(&dst).ok_or(IpcError::UnknownThread)?;
            d.ipc.queue.push_back(caller);
        }
        Ok(())
    }

    /// Fetch the next request, blocking if none is queued.
    pub fn await_request(&self, server: ThreadId) -> Result<(), IpcError> {
        let mut threads = self.threads.write();
        {
            let t = threads.get(&server).ok_or(IpcError::UnknownThread)?;
            if t.state != ThreadState::Active || t.ipc.phase != IpcPhase::Idle {
                return Err(IpcError::BadState);
            }
        }
        // Skip queue entries whose caller gave up in the meantime.
        loop {
            let next = threads
                .get_mut(&server)
                .ok_or(IpcError::UnknownThread)?
                .ipc
                .queue
                .pop_front();
            match next {
                Some(caller) => {
                    let valid = threads
                        .get(&caller)
                        .map(|c| {
                            c.state == ThreadState::AwaitsIpc
                                && c.ipc.phase == (IpcPhase::AwaitReply { peer: server })
                        })
                        .unwrap_or(false);
                    if valid {
                        self.hand_over(&mut threads, caller, server);
                        return Ok(());
                    }
                }
                None => {
                    let t = threads.get_mut(&server).ok_or(IpcError::UnknownThread)?;
                    t.ipc.phase = IpcPhase::AwaitRequest;
                    t.state = ThreadState::AwaitsIpc;
                    self.make_unready(t);
                    return Ok(());
                }
            }
        }
    }

    /// Answer the request currently held, waking its caller.
    pub fn send_reply(&self, server: ThreadId) -> Result<(), IpcError> {
        let mut threads = self.threads.write();
        let (caller, payload) = {
            let t = threads.get_mut(&server).ok_or(IpcError::UnknownThread)?;
            let IpcPhase::PrepareReply { caller } = t.ipc.phase else {
                return Err(IpcError::BadState);
            };
            if !t.utcb.caps().is_empty() {
                log::warn!("capabilities on a reply are not transferred");
                t.utcb.take_caps();
            }
            t.ipc.phase = IpcPhase::Idle;
            (caller, t.utcb.bytes().to_vec())
        };
        match threads.get_mut(&caller) {
            Some(c)
                if c.state == ThreadState::AwaitsIpc
                    && c.ipc.phase == (IpcPhase::AwaitReply { peer: server }) =>
            {
                // Fits by construction, both buffers are the same size.
                let _ = c.utcb.write_bytes(&payload);
                c.utcb.set_badge(0);
                c.ipc.phase = IpcPhase::Idle;
                c.ipc.result = Some(Ok(()));
                self.make_ready(c);
            }
            _ => log::warn!("reply of {:?} has no caller left", server),
        }
        Ok(())
    }

    /// Abort a thread's blocking IPC, if any. The thread wakes with a
    /// `BlockingCanceled` outcome.
    ///
    /// Capabilities already delegated ahead of an unfetched request are
    /// taken back, otherwise they would stay pinned in the destination PD
    /// with nobody left to acknowledge them.
    pub fn cancel_ipc(&self, id: ThreadId) -> Result<(), IpcError> {
        let reclaim = {
            let mut threads = self.threads.write();
            let reclaim = Self::take_unsent_caps(&mut threads, id);
            let phase = {
                let t = threads.get_mut(&id).ok_or(IpcError::UnknownThread)?;
                if t.state != ThreadState::AwaitsIpc {
                    return Ok(());
                }
                let phase = t.ipc.phase;
                t.ipc.phase = IpcPhase::Idle;
                t.ipc.result = Some(Err(IpcError::BlockingCanceled));
                self.make_ready(t);
                phase
            };
            if let IpcPhase::AwaitReply { peer } = phase {
                if let Some(p) = threads.get_mut(&peer) {
                    p.ipc.queue.retain(|q| *q != id);
                }
            }
            reclaim
        };
        if let Some((pd, caps)) = reclaim {
            self.reclaim_transferred_caps(pd, &caps);
        }
        Ok(())
    }

    /// Outcome of the thread's last blocking exchange.
    pub fn take_ipc_result(&self, id: ThreadId) -> Option<Result<(), IpcError>> {
        self.threads.write().get_mut(&id)?.ipc.result.take()
    }

    /// Release the revocation pin on a capability received via IPC.
    pub fn ack_cap(&self, thread: ThreadId, capid: Badge) -> Result<(), CapError> {
        let pd = {
            let threads = self.threads.read();
            threads
                .get(&thread)
                .ok_or(CapError::UnknownCapability)?
                .pd()
        };
        self.remove_from_utcb(pd, capid)
    }

    /// Stage a payload in a thread's message buffer.
    pub fn utcb_write(&self, thread: ThreadId, bytes: &[u8]) -> Result<(), IpcError> {
        let mut threads = self.threads.write();
        let t = threads.get_mut(&thread).ok_or(IpcError::UnknownThread)?;
        t.utcb.write_bytes(bytes)
    }

    /// Current payload of a thread's message buffer.
    pub fn utcb_read(&self, thread: ThreadId) -> Result<alloc::vec::Vec<u8>, IpcError> {
        let threads = self.threads.read();
        let t = threads.get(&thread).ok_or(IpcError::UnknownThread)?;
        Ok(t.utcb.bytes().to_vec())
    }

    /// Attach a capability to a thread's next outgoing request.
    pub fn utcb_attach_cap(&self, thread: ThreadId, capid: Badge) -> Result<(), IpcError> {
        let mut threads = self.threads.write();
        let t = threads.get_mut(&thread).ok_or(IpcError::UnknownThread)?;
        t.utcb.attach_cap(capid)
    }

    /// Capability slots of a thread's message buffer.
    pub fn utcb_caps(&self, thread: ThreadId) -> Result<alloc::vec::Vec<Badge>, IpcError> {
        let threads = self.threads.read();
        let t = threads.get(&thread).ok_or(IpcError::UnknownThread)?;
        Ok(t.utcb.caps().to_vec())
    }

    /// Sender badge of the last message a thread received.
    pub fn utcb_badge(&self, thread: ThreadId) -> Result<u64, IpcError> {
        let threads = self.threads.read();
        let t = threads.get(&thread).ok_or(IpcError::UnknownThread)?;
        Ok(t.utcb.badge())
    }

    /// Wake canceled IPC partners of a dying thread.
    ///
    /// Callers among them that still had a request queued get their
    /// pre-delegated capabilities taken back out of `dying_pd`.
    pub(crate) fn cancel_peers(&self, peers: &[ThreadId], dying_pd: crate::pd::PdId) {
        if peers.is_empty() {
            return;
        }
        let mut reclaim: Vec<Badge> = Vec::new();
        {
            let mut threads = self.threads.write();
            for id in peers {
                if let Some(t) = threads.get_mut(id) {
                    if t.state == ThreadState::AwaitsIpc {
                        if matches!(t.ipc.phase, IpcPhase::AwaitReply { .. }) {
                            reclaim.extend(t.utcb.take_caps());
                        }
                        t.ipc.phase = IpcPhase::Idle;
                        t.ipc.result = Some(Err(IpcError::BlockingCanceled));
                        self.make_ready(t);
                    }
                }
            }
        }
        self.reclaim_transferred_caps(dying_pd, &reclaim);
    }

    /// Strip a blocked caller of the capabilities it delegated ahead of a
    /// rendezvous that will no longer happen.
    ///
    /// Only applies while the request is still queued: a completed
    /// hand-over empties the caller's capability slots, and from then on
    /// acknowledging is the receiver's job.
    pub(crate) fn take_unsent_caps(
        threads: &mut alloc::collections::BTreeMap<ThreadId, crate::sched::thread::Thread>,
        id: ThreadId,
    ) -> Option<(crate::pd::PdId, heapless::Vec<Badge, { utcb::UTCB_CAP_SLOTS }>)> {
        let t = threads.get(&id)?;
        if t.state != ThreadState::AwaitsIpc {
            return None;
        }
        let IpcPhase::AwaitReply { peer } = t.ipc.phase else {
            return None;
        };
        let dst_pd = threads.get(&peer)?.pd();
        let caps = threads.get_mut(&id)?.utcb.take_caps();
        if caps.is_empty() {
            None
        } else {
            Some((dst_pd, caps))
        }
    }

    /// Unpin and revoke capabilities that were delegated into `pd` for a
    /// transfer that fell through.
    pub(crate) fn reclaim_transferred_caps(&self, pd: crate::pd::PdId, caps: &[Badge]) {
        for capid in caps {
            if self.remove_from_utcb(pd, *capid).is_err() {
                log::warn!("stale transferred badge {} not found", capid.raw());
                continue;
            }
            if let Err(e) = self.revoke(pd, *capid) {
                log::warn!(
                    "transferred badge {} not reclaimable: {:?}",
                    capid.raw(),
                    e
                );
            }
        }
    }

    /// Move a staged request from `caller` into `server` and flip both
    /// sides into the reply phase. Caller holds the thread table lock.
    fn hand_over(
        &self,
        threads: &mut alloc::collections::BTreeMap<ThreadId, crate::sched::thread::Thread>,
        caller: ThreadId,
        server: ThreadId,
    ) {
        let (payload, caps, badge) = {
            let Some(c) = threads.get_mut(&caller) else {
                return;
            };
            (
                c.utcb.bytes().to_vec(),
                c.utcb.take_caps(),
                c.ipc.send_badge,
            )
        };
        let Some(s) = threads.get_mut(&server) else {
            return;
        };
        let _ = s.utcb.write_bytes(&payload);
        s.utcb.set_badge(badge);
        let _ = s.utcb.take_caps();
        for capid in caps {
            s.utcb.put_cap(capid);
        }
        s.ipc.phase = IpcPhase::PrepareReply { caller };
        self.make_ready(s);
    }
}
