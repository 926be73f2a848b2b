//! # Asynchronous Signals
//!
//! Signals decouple event producers from consumers. A [`SignalContext`]
//! stands for one event source and carries an opaque imprint chosen by the
//! consumer; a [`SignalReceiver`] aggregates any number of contexts and
//! hands out one signal at a time to threads blocked on it.
//!
//! Submissions to the same context coalesce: the delivered count is the
//! number of submissions since the last delivery, never a queue of them.
//! A delivered signal stays *in flight* until the consumer acknowledges
//! it; further submissions during that window accumulate silently and
//! re-arm the context on acknowledgement.
//!
//! Destroying an in-flight context must not yank state the consumer is
//! still looking at. The destroyer parks until the acknowledgement
//! arrives, which then finalizes the destruction and wakes the destroyer.
//!
//! Lock order inside this module: receiver table before context table,
//! receiver state before context state. Thread-table access never
//! overlaps either; deliveries are decided first and applied after all
//! signal locks are dropped.

use crate::cap::{ObjectId, ObjectPayload};
use crate::pd::PdId;
use crate::sched::thread::{ThreadId, ThreadState};
use crate::sync::ObjectLock;
use crate::Kernel;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

/// Signal-context identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(pub(crate) u64);

/// Signal-receiver identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReceiverId(pub(crate) u64);

/// One delivered signal: the context's imprint plus the number of
/// submissions it coalesces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signal {
    /// Consumer-chosen context label.
    pub imprint: u64,
    /// Submissions folded into this delivery.
    pub num: u64,
}

/// Signal-subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// No receiver with the given id exists.
    UnknownReceiver,
    /// No context with the given id exists.
    UnknownContext,
    /// No thread with the given id exists.
    UnknownThread,
    /// Polled a receiver with nothing pending.
    NotPending,
    /// The context is already assigned to a receiver.
    ContextAlreadyInUse,
    /// The context is not assigned to this receiver.
    ContextNotAssociated,
    /// The context was destroyed.
    ContextDestroyed,
    /// The supplied capability does not name the expected object.
    InvalidCapability,
}

struct ContextState {
    imprint: u64,
    receiver: Option<ReceiverId>,
    /// Submissions since the last delivery.
    count: u64,
    pending: bool,
    /// Delivered but not yet acknowledged.
    in_flight: bool,
    /// Thread parked until the in-flight delivery is acknowledged.
    killer: Option<ThreadId>,
    dead: bool,
}

/// One event source.
pub struct SignalContext {
    object: ObjectId,
    state: ObjectLock<ContextState>,
}

struct ReceiverState {
    /// Contexts in management order; delivery scans this order.
    contexts: Vec<ContextId>,
    /// Threads blocked on this receiver, served FIFO.
    waiters: VecDeque<ThreadId>,
}

/// Aggregation point for any number of contexts.
pub struct SignalReceiver {
    object: ObjectId,
    inner: ObjectLock<ReceiverState>,
}

/// Signal operations on the kernel facade.
impl Kernel {
    /// Create a signal receiver.
    pub fn new_receiver(&self) -> ReceiverId {
        let id = ReceiverId(self.ids.next_receiver());
        let object = self.caps.new_object(ObjectPayload::SignalReceiver(id));
        self.receivers.write().insert(
            id,
            SignalReceiver {
                object,
                inner: ObjectLock::new(ReceiverState {
                    contexts: Vec::new(),
                    waiters: VecDeque::new(),
                }),
            },
        );
        id
    }

    /// Create an unmanaged signal context labeled with `imprint`.
    pub fn new_context(&self, imprint: u64) -> ContextId {
        let id = ContextId(self.ids.next_context());
        let object = self.caps.new_object(ObjectPayload::SignalContext(id));
        self.contexts.write().insert(
            id,
            SignalContext {
                object,
                state: ObjectLock::new(ContextState {
                    imprint,
                    receiver: None,
                    count: 0,
                    pending: false,
                    in_flight: false,
                    killer: None,
                    dead: false,
                }),
            },
        );
        id
    }

    /// Kernel object backing a receiver.
    pub fn receiver_object(&self, id: ReceiverId) -> Option<ObjectId> {
        self.receivers.read().get(&id).map(|r| r.object)
    }

    /// Kernel object backing a context.
    pub fn context_object(&self, id: ContextId) -> Option<ObjectId> {
        self.contexts.read().get(&id).map(|c| c.object)
    }

    /// Assign a context to a receiver. A context belongs to at most one
    /// receiver over its whole lifetime slot.
    pub fn manage_context(&self, rid: ReceiverId, cid: ContextId) -> Result<(), SignalError> {
        let flush = {
            let receivers = self.receivers.read();
            let receiver = receivers.get(&rid).ok_or(SignalError::UnknownReceiver)?;
            let mut inner = receiver.inner.lock();
            let contexts = self.contexts.read();
            let ctx = contexts.get(&cid).ok_or(SignalError::UnknownContext)?;
            let mut state = ctx.state.lock();
            if state.dead {
                return Err(SignalError::ContextDestroyed);
            }
            if state.receiver.is_some() {
                return Err(SignalError::ContextAlreadyInUse);
            }
            state.receiver = Some(rid);
            inner.contexts.push(cid);
            state.pending
        };
        if flush {
            self.flush_receiver(rid);
        }
        Ok(())
    }

    /// Detach a context from its receiver.
    ///
    /// An in-flight delivery stays valid for the consumer; the pending
    /// counter is discarded.
    pub fn dissolve_context(&self, rid: ReceiverId, cid: ContextId) -> Result<(), SignalError> {
        let receivers = self.receivers.read();
        let receiver = receivers.get(&rid).ok_or(SignalError::UnknownReceiver)?;
        let mut inner = receiver.inner.lock();
        let contexts = self.contexts.read();
        let ctx = contexts.get(&cid).ok_or(SignalError::UnknownContext)?;
        let mut state = ctx.state.lock();
        if state.receiver != Some(rid) {
            return Err(SignalError::ContextNotAssociated);
        }
        state.receiver = None;
        state.pending = false;
        state.count = 0;
        inner.contexts.retain(|c| *c != cid);
        Ok(())
    }

    /// Submit `count` occurrences of the context's event.
    pub fn submit_to_context(&self, cid: ContextId, count: u64) -> Result<(), SignalError> {
        let flush = {
            let contexts = self.contexts.read();
            let ctx = contexts.get(&cid).ok_or(SignalError::UnknownContext)?;
            let mut state = ctx.state.lock();
            if state.dead {
                return Err(SignalError::ContextDestroyed);
            }
            state.count += count;
            if state.in_flight {
                // Coalesces into the re-arm on acknowledgement.
                None
            } else {
                state.pending = true;
                state.receiver
            }
        };
        if let Some(rid) = flush {
            self.flush_receiver(rid);
        }
        Ok(())
    }

    /// Submit through a context capability held by `pd`.
    pub fn submit_signal(&self, pd: PdId, capid: crate::cap::Badge, count: u64) -> Result<(), SignalError> {
        let cid = self
            .payload_of(pd, capid)
            .ok()
            .and_then(|p| p.as_signal_context().ok())
            .ok_or(SignalError::InvalidCapability)?;
        self.submit_to_context(cid, count)
    }

    /// Poll a receiver without blocking.
    ///
    /// On success the returned signal is in flight and must be
    /// acknowledged before the same context can deliver again.
    pub fn pending_signal(&self, rid: ReceiverId) -> Result<Signal, SignalError> {
        let receivers = self.receivers.read();
        let receiver = receivers.get(&rid).ok_or(SignalError::UnknownReceiver)?;
        let inner = receiver.inner.lock();
        let contexts = self.contexts.read();
        for cid in &inner.contexts {
            if let Some(ctx) = contexts.get(cid) {
                let mut state = ctx.state.lock();
                if state.pending && !state.in_flight {
                    return Ok(Self::take_delivery(&mut state));
                }
            }
        }
        Err(SignalError::NotPending)
    }

    /// Block a thread on a receiver.
    ///
    /// If a signal is already pending it is delivered into the thread's
    /// message buffer right away and the thread stays runnable.
    pub fn await_signal(&self, thread: ThreadId, rid: ReceiverId) -> Result<(), SignalError> {
        if !self.receivers.read().contains_key(&rid) {
            return Err(SignalError::UnknownReceiver);
        }
        // Block before enqueuing, so a submission racing with this call
        // finds the thread ready to be woken rather than about to sleep.
        {
            let mut threads = self.threads.write();
            let t = threads
                .get_mut(&thread)
                .ok_or(SignalError::UnknownThread)?;
            t.state = ThreadState::AwaitsSignal;
            t.awaited_receiver = Some(rid);
            self.make_unready(t);
        }
        {
            let receivers = self.receivers.read();
            let receiver = receivers.get(&rid).ok_or(SignalError::UnknownReceiver)?;
            receiver.inner.lock().waiters.push_back(thread);
        }
        self.flush_receiver(rid);
        Ok(())
    }

    /// Acknowledge the last delivery of a context.
    ///
    /// Completes a destruction that was parked on this delivery, or
    /// re-arms the context if submissions accumulated in flight.
    pub fn ack_context(&self, cid: ContextId) -> Result<(), SignalError> {
        let (rearm, finalize) = {
            let contexts = self.contexts.read();
            let ctx = contexts.get(&cid).ok_or(SignalError::UnknownContext)?;
            let mut state = ctx.state.lock();
            if !state.in_flight {
                log::warn!("acknowledgement of context {:?} with nothing in flight", cid);
                return Ok(());
            }
            state.in_flight = false;
            match state.killer.take() {
                Some(killer) => {
                    state.dead = true;
                    state.pending = false;
                    state.count = 0;
                    (None, Some((killer, state.receiver.take())))
                }
                None => {
                    if state.count > 0 {
                        state.pending = true;
                        (state.receiver, None)
                    } else {
                        (None, None)
                    }
                }
            }
        };
        if let Some(rid) = rearm {
            self.flush_receiver(rid);
        }
        if let Some((killer, rid)) = finalize {
            self.finalize_context_destruction(cid, rid);
            let mut threads = self.threads.write();
            if let Some(t) = threads.get_mut(&killer) {
                if t.state == ThreadState::AwaitsSignalContextKill && t.kill_target == Some(cid) {
                    t.kill_target = None;
                    self.make_ready(t);
                }
            }
        }
        Ok(())
    }

    /// Destroy a context on behalf of `killer`.
    ///
    /// If a delivery is in flight the destruction is deferred until the
    /// consumer acknowledges it; `killer` blocks for that duration.
    pub fn kill_context(&self, killer: ThreadId, cid: ContextId) -> Result<(), SignalError> {
        let (parked, rid) = {
            let contexts = self.contexts.read();
            let ctx = contexts.get(&cid).ok_or(SignalError::UnknownContext)?;
            let mut state = ctx.state.lock();
            if state.dead {
                return Err(SignalError::ContextDestroyed);
            }
            if state.in_flight {
                state.killer = Some(killer);
                (true, None)
            } else {
                state.dead = true;
                state.pending = false;
                state.count = 0;
                (false, state.receiver.take())
            }
        };
        if parked {
            let mut threads = self.threads.write();
            let t = threads
                .get_mut(&killer)
                .ok_or(SignalError::UnknownThread)?;
            t.state = ThreadState::AwaitsSignalContextKill;
            t.kill_target = Some(cid);
            self.make_unready(t);
        } else {
            self.finalize_context_destruction(cid, rid);
        }
        Ok(())
    }

    /// Destroy a receiver, force-dissolving its contexts and waking any
    /// blocked waiters empty-handed.
    pub fn destroy_receiver(&self, rid: ReceiverId) -> Result<(), SignalError> {
        let receiver = self
            .receivers
            .write()
            .remove(&rid)
            .ok_or(SignalError::UnknownReceiver)?;
        let state = receiver.inner.lock();
        {
            let contexts = self.contexts.read();
            for cid in &state.contexts {
                if let Some(ctx) = contexts.get(cid) {
                    let mut cstate = ctx.state.lock();
                    cstate.receiver = None;
                    cstate.pending = false;
                    cstate.count = 0;
                }
            }
        }
        let waiters: Vec<ThreadId> = state.waiters.iter().copied().collect();
        drop(state);
        {
            let mut threads = self.threads.write();
            for waiter in waiters {
                if let Some(t) = threads.get_mut(&waiter) {
                    if t.state == ThreadState::AwaitsSignal {
                        log::warn!("receiver {:?} destroyed under waiter {:?}", rid, waiter);
                        t.awaited_receiver = None;
                        self.make_ready(t);
                    }
                }
            }
        }
        if self.caps.destroy_object(receiver.object).is_err() {
            log::warn!("receiver {:?} had no backing object", rid);
        }
        Ok(())
    }

    /// Signal most recently delivered into a thread's message buffer.
    pub fn delivered_signal(&self, thread: ThreadId) -> Option<Signal> {
        self.threads.read().get(&thread)?.utcb.read_signal()
    }

    /// Drop a thread from a receiver's wait queue, used on thread
    /// destruction.
    pub(crate) fn forget_signal_waiter(&self, rid: ReceiverId, thread: ThreadId) {
        let receivers = self.receivers.read();
        if let Some(receiver) = receivers.get(&rid) {
            receiver.inner.lock().waiters.retain(|t| *t != thread);
        }
    }

    fn take_delivery(state: &mut ContextState) -> Signal {
        let signal = Signal {
            imprint: state.imprint,
            num: state.count,
        };
        state.count = 0;
        state.pending = false;
        state.in_flight = true;
        signal
    }

    /// Pair pending contexts with blocked waiters until one side runs dry.
    ///
    /// A popped waiter that turns out to be gone does not consume the
    /// delivery: the context is re-armed and the next waiter gets it.
    fn flush_receiver(&self, rid: ReceiverId) {
        loop {
            let delivery = {
                let receivers = self.receivers.read();
                let Some(receiver) = receivers.get(&rid) else {
                    return;
                };
                let mut inner = receiver.inner.lock();
                if inner.waiters.is_empty() {
                    return;
                }
                let contexts = self.contexts.read();
                let mut taken = None;
                for cid in &inner.contexts {
                    if let Some(ctx) = contexts.get(cid) {
                        let mut state = ctx.state.lock();
                        if state.pending && !state.in_flight {
                            taken = Some((*cid, Self::take_delivery(&mut state)));
                            break;
                        }
                    }
                }
                match taken {
                    Some((cid, signal)) => {
                        inner.waiters.pop_front().map(|t| (cid, t, signal))
                    }
                    None => return,
                }
            };
            let Some((cid, thread, signal)) = delivery else {
                return;
            };
            let delivered = {
                let mut threads = self.threads.write();
                match threads.get_mut(&thread) {
                    Some(t) if t.state == ThreadState::AwaitsSignal => {
                        t.awaited_receiver = None;
                        t.utcb.write_signal(signal);
                        self.make_ready(t);
                        true
                    }
                    _ => false,
                }
            };
            if !delivered {
                log::warn!("signal waiter {:?} vanished before delivery", thread);
                self.rearm_context(cid, signal.num);
            }
        }
    }

    /// Put an undeliverable signal back onto its context.
    fn rearm_context(&self, cid: ContextId, num: u64) {
        let contexts = self.contexts.read();
        if let Some(ctx) = contexts.get(&cid) {
            let mut state = ctx.state.lock();
            if !state.dead {
                state.count += num;
                state.pending = true;
                state.in_flight = false;
                return;
            }
        }
        log::warn!("undeliverable signal on destroyed context {:?}", cid);
    }

    fn finalize_context_destruction(&self, cid: ContextId, rid: Option<ReceiverId>) {
        if let Some(rid) = rid {
            let receivers = self.receivers.read();
            if let Some(receiver) = receivers.get(&rid) {
                receiver.inner.lock().contexts.retain(|c| *c != cid);
            }
        }
        let removed = self.contexts.write().remove(&cid);
        if let Some(ctx) = removed {
            if self.caps.destroy_object(ctx.object).is_err() {
                log::warn!("context {:?} had no backing object", cid);
            }
        }
    }
}
