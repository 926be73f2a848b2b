//! # CPU Scheduling
//!
//! Fixed-priority, round-robin scheduler. Each CPU owns one
//! [`CpuScheduler`]; a subject (thread or virtual machine) lives in
//! exactly one of them.
//!
//! Within a priority band, subjects take turns in FIFO order: the running
//! subject goes to the tail of its band when its quantum expires or it
//! yields. A subject preempted by a higher band goes to the *front* of its
//! own band instead, so it resumes as soon as the higher band drains.
//! There is no aging; a saturated higher band starves lower bands by
//! design of the priority model.

pub mod thread;

use alloc::collections::{BTreeMap, VecDeque};

/// Number of priority bands. Higher value wins.
pub const PRIORITY_LEVELS: usize = 4;

/// Scheduling priority, `0..PRIORITY_LEVELS`.
pub type Priority = u8;

/// Scheduling errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// No subject with the given id exists.
    UnknownSubject,
    /// The operation does not apply to the thread's current state.
    InvalidState,
    /// The CPU index is out of range.
    InvalidCpu,
    /// The priority is outside the supported bands.
    InvalidPriority,
}

/// Identity of a schedulable subject.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ScheduleId {
    /// A thread, by raw thread id.
    Thread(u64),
    /// A virtual machine, by raw VM id.
    Vm(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    /// Eligible to run: queued in its band or currently dispatched.
    Ready,
    /// Blocked or paused; not in any band.
    Inactive,
}

struct Slot {
    priority: Priority,
    state: SlotState,
}

/// Per-CPU scheduler state.
///
/// The currently dispatched subject is held out of its band queue; its
/// slot stays `Ready` so that `ready` remains idempotent.
pub struct CpuScheduler {
    slots: BTreeMap<ScheduleId, Slot>,
    bands: [VecDeque<ScheduleId>; PRIORITY_LEVELS],
    current: Option<ScheduleId>,
}

impl CpuScheduler {
    pub fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
            bands: core::array::from_fn(|_| VecDeque::new()),
            current: None,
        }
    }

    /// Register a subject. It starts inactive.
    pub fn insert(&mut self, id: ScheduleId, priority: Priority) -> Result<(), SchedError> {
        if priority as usize >= PRIORITY_LEVELS {
            return Err(SchedError::InvalidPriority);
        }
        let prev = self.slots.insert(
            id,
            Slot {
                priority,
                state: SlotState::Inactive,
            },
        );
        debug_assert!(prev.is_none(), "subject {:?} registered twice", id);
        Ok(())
    }

    /// Unregister a subject, wherever it currently is.
    pub fn remove(&mut self, id: ScheduleId) {
        if let Some(slot) = self.slots.remove(&id) {
            self.bands[slot.priority as usize].retain(|s| *s != id);
        }
        if self.current == Some(id) {
            self.current = None;
        }
    }

    /// Make a subject eligible to run. Idempotent.
    ///
    /// Returns true when the caller should re-run [`schedule`](Self::schedule)
    /// because the new subject outranks the current one.
    pub fn ready(&mut self, id: ScheduleId) -> bool {
        let Some(slot) = self.slots.get_mut(&id) else {
            log::warn!("ready on unregistered subject {:?}", id);
            return false;
        };
        if slot.state == SlotState::Ready {
            return false;
        }
        slot.state = SlotState::Ready;
        let priority = slot.priority;
        self.bands[priority as usize].push_back(id);
        match self.current {
            None => true,
            Some(cur) => priority > self.priority_of(cur),
        }
    }

    /// Take a subject out of contention. Idempotent.
    pub fn unready(&mut self, id: ScheduleId) {
        let Some(slot) = self.slots.get_mut(&id) else {
            log::warn!("unready on unregistered subject {:?}", id);
            return;
        };
        if slot.state == SlotState::Inactive {
            return;
        }
        slot.state = SlotState::Inactive;
        let priority = slot.priority;
        self.bands[priority as usize].retain(|s| *s != id);
        if self.current == Some(id) {
            self.current = None;
        }
    }

    /// Pick the subject to dispatch.
    ///
    /// Keeps the current subject unless a strictly higher band has a
    /// candidate; a preempted subject is pushed to the front of its own
    /// band so it resumes before its round-robin peers.
    pub fn schedule(&mut self) -> Option<ScheduleId> {
        let next = self.head();
        match (self.current, next) {
            (Some(cur), Some(n)) if self.priority_of(n) > self.priority_of(cur) => {
                let band = self.priority_of(cur) as usize;
                self.bands[band].push_front(cur);
                self.dispatch(n);
            }
            (Some(_), _) => {}
            (None, Some(n)) => self.dispatch(n),
            (None, None) => {}
        }
        self.current
    }

    /// The currently dispatched subject.
    pub fn current(&self) -> Option<ScheduleId> {
        self.current
    }

    /// The subject's quantum ran out: move it behind its band peers.
    pub fn quantum_expired(&mut self) -> Option<ScheduleId> {
        self.round_robin();
        self.schedule()
    }

    /// The current subject gives up the rest of its quantum.
    pub fn yield_current(&mut self) -> Option<ScheduleId> {
        self.round_robin();
        self.schedule()
    }

    fn round_robin(&mut self) {
        if let Some(cur) = self.current.take() {
            let band = self.priority_of(cur) as usize;
            self.bands[band].push_back(cur);
        }
    }

    fn dispatch(&mut self, id: ScheduleId) {
        let band = self.priority_of(id) as usize;
        // The dispatched subject leaves its queue but stays Ready.
        if let Some(pos) = self.bands[band].iter().position(|s| *s == id) {
            self.bands[band].remove(pos);
        }
        self.current = Some(id);
    }

    fn head(&self) -> Option<ScheduleId> {
        self.bands
            .iter()
            .rev()
            .find_map(|band| band.front().copied())
    }

    fn priority_of(&self, id: ScheduleId) -> Priority {
        self.slots.get(&id).map(|s| s.priority).unwrap_or(0)
    }
}

impl Default for CpuScheduler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(id: u64) -> ScheduleId {
        ScheduleId::Thread(id)
    }

    #[test]
    fn fifo_within_one_band() {
        let mut sched = CpuScheduler::new();
        for id in [1, 2, 3] {
            sched.insert(t(id), 1).unwrap();
            sched.ready(t(id));
        }

        assert_eq!(sched.schedule(), Some(t(1)));
        assert_eq!(sched.quantum_expired(), Some(t(2)));
        assert_eq!(sched.quantum_expired(), Some(t(3)));
        // Round robin wraps back to the first subject.
        assert_eq!(sched.quantum_expired(), Some(t(1)));
    }

    #[test]
    fn higher_band_preempts_and_loser_resumes_first() {
        let mut sched = CpuScheduler::new();
        sched.insert(t(1), 1).unwrap();
        sched.insert(t(2), 1).unwrap();
        sched.insert(t(3), 3).unwrap();
        sched.ready(t(1));
        sched.ready(t(2));
        assert_eq!(sched.schedule(), Some(t(1)));

        // A higher-priority subject arrives and takes over.
        assert!(sched.ready(t(3)));
        assert_eq!(sched.schedule(), Some(t(3)));

        // When it blocks, the preempted subject runs before its band peer.
        sched.unready(t(3));
        assert_eq!(sched.schedule(), Some(t(1)));
        assert_eq!(sched.quantum_expired(), Some(t(2)));
    }

    #[test]
    fn equal_priority_does_not_preempt() {
        let mut sched = CpuScheduler::new();
        sched.insert(t(1), 2).unwrap();
        sched.insert(t(2), 2).unwrap();
        sched.ready(t(1));
        assert_eq!(sched.schedule(), Some(t(1)));

        assert!(!sched.ready(t(2)));
        assert_eq!(sched.schedule(), Some(t(1)));
    }

    #[test]
    fn ready_and_unready_are_idempotent() {
        let mut sched = CpuScheduler::new();
        sched.insert(t(1), 0).unwrap();
        sched.ready(t(1));
        sched.ready(t(1));
        assert_eq!(sched.schedule(), Some(t(1)));
        sched.unready(t(1));
        sched.unready(t(1));
        assert_eq!(sched.schedule(), None);

        // A double ready must not enqueue the subject twice.
        sched.insert(t(2), 0).unwrap();
        sched.ready(t(1));
        sched.ready(t(1));
        sched.ready(t(2));
        assert_eq!(sched.schedule(), Some(t(1)));
        sched.unready(t(1));
        assert_eq!(sched.schedule(), Some(t(2)));
        assert_eq!(sched.quantum_expired(), Some(t(2)));
    }

    #[test]
    fn unready_current_picks_next() {
        let mut sched = CpuScheduler::new();
        sched.insert(t(1), 1).unwrap();
        sched.insert(t(2), 1).unwrap();
        sched.ready(t(1));
        sched.ready(t(2));
        assert_eq!(sched.schedule(), Some(t(1)));

        sched.unready(t(1));
        assert_eq!(sched.current(), None);
        assert_eq!(sched.schedule(), Some(t(2)));
    }

    #[test]
    fn remove_while_queued_or_current() {
        let mut sched = CpuScheduler::new();
        sched.insert(t(1), 1).unwrap();
        sched.insert(t(2), 1).unwrap();
        sched.ready(t(1));
        sched.ready(t(2));
        assert_eq!(sched.schedule(), Some(t(1)));

        sched.remove(t(2));
        sched.remove(t(1));
        assert_eq!(sched.schedule(), None);
    }

    #[test]
    fn vm_and_thread_subjects_coexist() {
        let mut sched = CpuScheduler::new();
        sched.insert(ScheduleId::Thread(1), 1).unwrap();
        sched.insert(ScheduleId::Vm(1), 1).unwrap();
        sched.ready(ScheduleId::Thread(1));
        sched.ready(ScheduleId::Vm(1));

        assert_eq!(sched.schedule(), Some(ScheduleId::Thread(1)));
        assert_eq!(sched.quantum_expired(), Some(ScheduleId::Vm(1)));
    }

    #[test]
    fn priority_out_of_range_is_rejected() {
        let mut sched = CpuScheduler::new();
        assert_eq!(
            sched.insert(t(1), PRIORITY_LEVELS as Priority),
            Err(SchedError::InvalidPriority)
        );
    }
}
