//! Badge allocation
//!
//! Badges are the unforgeable integer names behind every capability. They
//! are drawn from a fixed range and never take the value 0, which is
//! reserved as the invalid badge.

use super::CapError;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

/// Number of badges a default allocator hands out.
pub const DEFAULT_BADGE_CAPACITY: usize = 4096;

/// Unforgeable capability identifier, never 0.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Badge(u64);

impl Badge {
    /// Raw badge value.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Construct from a raw value, rejecting the invalid badge 0.
    pub fn from_raw(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }
}

impl core::fmt::Debug for Badge {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Badge({})", self.0)
    }
}

struct BadgeBitmap {
    free: Vec<bool>,
    first_free: usize,
}

impl BadgeBitmap {
    /// Advance the first-free hint past the slot that was just taken.
    fn first_free_assigned(&mut self) {
        self.first_free += 1;
        while self.first_free < self.free.len() && !self.free[self.first_free] {
            self.first_free += 1;
        }
    }
}

/// Issues unique badges from a fixed range, serialized by one lock.
///
/// Slot 0 of the bitmap is permanently taken so that badge 0 can never be
/// handed out.
pub struct BadgeAllocator {
    inner: Mutex<BadgeBitmap>,
}

impl BadgeAllocator {
    /// Create an allocator covering badges `1..=capacity`.
    pub fn new(capacity: usize) -> Self {
        let mut free = vec![true; capacity + 1];
        free[0] = false;
        Self {
            inner: Mutex::new(BadgeBitmap { free, first_free: 1 }),
        }
    }

    /// Allocate a fresh, currently-unused badge.
    pub fn alloc(&self) -> Result<Badge, CapError> {
        let mut bitmap = self.inner.lock();
        if bitmap.first_free >= bitmap.free.len() {
            return Err(CapError::OutOfBadges);
        }
        let id = bitmap.first_free;
        bitmap.free[id] = false;
        bitmap.first_free_assigned();
        Ok(Badge(id as u64))
    }

    /// Return a badge to the pool.
    ///
    /// Freeing an unallocated or out-of-range badge is tolerated (teardown
    /// paths may race) and only logged.
    pub fn free(&self, badge: Badge) {
        let mut bitmap = self.inner.lock();
        let id = badge.raw() as usize;
        if id == 0 || id >= bitmap.free.len() {
            log::warn!("attempt to free out-of-range badge {}", badge.raw());
            return;
        }
        if bitmap.free[id] {
            log::warn!("attempt to free unallocated badge {}", badge.raw());
            return;
        }
        bitmap.free[id] = true;
        if id < bitmap.first_free {
            bitmap.first_free = id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeSet;

    #[test]
    fn badges_are_unique_and_nonzero() {
        let alloc = BadgeAllocator::new(64);
        let mut seen = BTreeSet::new();
        for _ in 0..64 {
            let badge = alloc.alloc().unwrap();
            assert_ne!(badge.raw(), 0);
            assert!(seen.insert(badge), "duplicate badge {:?}", badge);
        }
    }

    #[test]
    fn exhaustion_then_reuse_after_free() {
        let alloc = BadgeAllocator::new(3);
        let b1 = alloc.alloc().unwrap();
        let _b2 = alloc.alloc().unwrap();
        let _b3 = alloc.alloc().unwrap();
        assert_eq!(alloc.alloc(), Err(CapError::OutOfBadges));

        alloc.free(b1);
        let b4 = alloc.alloc().unwrap();
        assert_eq!(b4, b1);
        assert_eq!(alloc.alloc(), Err(CapError::OutOfBadges));
    }

    #[test]
    fn free_tolerates_bad_input() {
        let alloc = BadgeAllocator::new(4);
        // Out of range and double free are no-ops.
        alloc.free(Badge::from_raw(999).unwrap());
        let b = alloc.alloc().unwrap();
        alloc.free(b);
        alloc.free(b);
        // Pool is still consistent afterwards.
        let again = alloc.alloc().unwrap();
        assert_eq!(again, b);
    }

    #[test]
    fn zero_badge_is_invalid() {
        assert!(Badge::from_raw(0).is_none());
        assert!(Badge::from_raw(1).is_some());
    }

    #[test]
    fn first_free_hint_prefers_lowest() {
        let alloc = BadgeAllocator::new(8);
        let badges: alloc::vec::Vec<_> = (0..5).map(|_| alloc.alloc().unwrap()).collect();
        alloc.free(badges[1]);
        alloc.free(badges[3]);
        // Lowest freed badge is reissued first.
        assert_eq!(alloc.alloc().unwrap(), badges[1]);
        assert_eq!(alloc.alloc().unwrap(), badges[3]);
    }
}
