//! # Ordered Locking Primitives
//!
//! Lock wrappers that carry their position in the kernel locking
//! discipline as a type-level tag. The discipline, lowest acquired first:
//!
//! - Level 0, tables: the maps from id to object (PDs, threads,
//!   receivers, contexts, IRQs, VMs). Tables follow a fixed mutual order:
//!   PDs, threads, receivers, contexts, IRQs, VMs; a later table may be
//!   acquired while an earlier one is held, never the reverse. The one
//!   sanctioned interleaving is that the context table ranks behind
//!   receiver *state*, so signal delivery can walk receiver -> contexts.
//! - Level 1, schedulers: per-CPU run-queue state, acquired under the
//!   thread table at most.
//! - Level 2, object state: PD capability trees, receiver and context
//!   state. When two capability trees must be held at once (cross-PD
//!   delegation), the tree of the lower PD id is taken first; receiver
//!   state precedes context state.
//! - Level 3, the capability store: badges, objects and identities. A
//!   leaf - no other lock is ever acquired while it is held.
//!
//! The thread table is never held across signal or capability-store
//! operations; wakeups are decided first and applied after those locks
//! are dropped.

use spin::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lock ordering levels, lowest acquired first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockLevel {
    /// Level 0: id-to-object tables.
    Table = 0,
    /// Level 1: per-CPU scheduler state.
    Scheduler = 1,
    /// Level 2: individual object state.
    Object = 2,
    /// Level 3: the capability store, a leaf.
    CapStore = 3,
}

/// A read-write lock with an associated ordering level.
pub struct OrderedRwLock<T, const LEVEL: u8> {
    inner: RwLock<T>,
}

impl<T, const LEVEL: u8> OrderedRwLock<T, LEVEL> {
    pub const fn new(value: T) -> Self {
        Self { inner: RwLock::new(value) }
    }

    #[inline]
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.inner.read()
    }

    #[inline]
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.inner.write()
    }

    #[inline]
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        self.inner.try_write()
    }

    #[inline]
    pub const fn level(&self) -> u8 {
        LEVEL
    }
}

/// A mutex with an associated ordering level.
pub struct OrderedMutex<T, const LEVEL: u8> {
    inner: Mutex<T>,
}

impl<T, const LEVEL: u8> OrderedMutex<T, LEVEL> {
    pub const fn new(value: T) -> Self {
        Self { inner: Mutex::new(value) }
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    #[inline]
    pub const fn level(&self) -> u8 {
        LEVEL
    }
}

/// Level 0 lock - id-to-object tables.
pub type TableLock<T> = OrderedRwLock<T, 0>;

/// Level 1 mutex - per-CPU scheduler state.
pub type SchedulerLock<T> = OrderedMutex<T, 1>;

/// Level 2 mutex - individual object state.
pub type ObjectLock<T> = OrderedMutex<T, 2>;

/// Level 3 mutex - the capability store.
pub type CapStoreLock<T> = OrderedMutex<T, 3>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_levels() {
        let table: TableLock<i32> = TableLock::new(1);
        let sched: SchedulerLock<i32> = SchedulerLock::new(2);
        let object: ObjectLock<i32> = ObjectLock::new(3);
        let store: CapStoreLock<i32> = CapStoreLock::new(4);

        assert_eq!(table.level(), 0);
        assert_eq!(sched.level(), 1);
        assert_eq!(object.level(), 2);
        assert_eq!(store.level(), 3);
    }

    #[test]
    fn read_write() {
        let lock: TableLock<i32> = TableLock::new(42);
        assert_eq!(*lock.read(), 42);
        *lock.write() = 100;
        assert_eq!(*lock.read(), 100);
    }

    #[test]
    fn mutex_roundtrip() {
        let lock: ObjectLock<i32> = ObjectLock::new(7);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 8);
        assert!(lock.try_lock().is_some());
    }
}
