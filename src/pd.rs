//! Protection domains
//!
//! A protection domain (PD) is the unit of isolation: it owns the
//! capability tree that turns badges into object-identity references. The
//! tree is an ordered map keyed by badge, giving O(log n) insert, remove
//! and find; badges are unique within one tree at any instant because they
//! come from the global badge allocator.

use crate::cap::{Badge, ObjectId, Oir};
use crate::sync::ObjectLock;
use alloc::collections::BTreeMap;

/// Protection-domain identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PdId(pub(crate) u64);

impl PdId {
    /// Raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Per-PD capability lookup tree.
pub type CapTree = BTreeMap<Badge, Oir>;

/// A protection domain: an isolated principal with its own capability
/// table.
pub struct Pd {
    id: PdId,
    pub(crate) object: ObjectId,
    /// For cross-PD delegation the tree of the lower PdId is locked first.
    pub(crate) tree: ObjectLock<CapTree>,
}

impl Pd {
    pub(crate) fn new(id: PdId, object: ObjectId) -> Self {
        Self {
            id,
            object,
            tree: ObjectLock::new(CapTree::new()),
        }
    }

    /// PD id.
    pub fn id(&self) -> PdId {
        self.id
    }

    /// Kernel object backing this PD.
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Look up the reference filed under `capid`.
    pub fn find(&self, capid: Badge) -> Option<Oir> {
        self.tree.lock().get(&capid).copied()
    }

    /// Number of capabilities currently held by this PD.
    pub fn cap_count(&self) -> usize {
        self.tree.lock().len()
    }

    pub(crate) fn insert(&self, oir: Oir) {
        let prev = self.tree.lock().insert(oir.capid, oir);
        debug_assert!(prev.is_none(), "duplicate capid in PD tree");
    }

    pub(crate) fn remove(&self, capid: Badge) -> Option<Oir> {
        self.tree.lock().remove(&capid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cap::IdentityId;

    fn oir(capid: u64) -> Oir {
        Oir {
            capid: Badge::from_raw(capid).unwrap(),
            identity: IdentityId(1),
            in_utcb: 0,
        }
    }

    /// Small deterministic PRNG, good enough to shuffle tree operations.
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    #[test]
    fn find_hits_and_misses() {
        let pd = Pd::new(PdId(1), ObjectId(1));
        pd.insert(oir(10));
        pd.insert(oir(20));

        assert!(pd.find(Badge::from_raw(10).unwrap()).is_some());
        assert!(pd.find(Badge::from_raw(20).unwrap()).is_some());
        assert!(pd.find(Badge::from_raw(30).unwrap()).is_none());
    }

    #[test]
    fn remove_preserves_survivors() {
        let pd = Pd::new(PdId(1), ObjectId(1));
        for capid in 1..=7u64 {
            pd.insert(oir(capid));
        }
        pd.remove(Badge::from_raw(4).unwrap());

        for capid in 1..=7u64 {
            let badge = Badge::from_raw(capid).unwrap();
            assert_eq!(pd.find(badge).is_some(), capid != 4);
        }
    }

    #[test]
    fn randomized_insert_remove_find() {
        let pd = Pd::new(PdId(1), ObjectId(1));
        let mut rng = XorShift(0x9e3779b97f4a7c15);
        let mut live = alloc::collections::BTreeSet::new();

        for _ in 0..2000 {
            let capid = rng.next() % 256 + 1;
            let badge = Badge::from_raw(capid).unwrap();
            match rng.next() % 3 {
                0 => {
                    if live.insert(capid) {
                        pd.insert(oir(capid));
                    }
                }
                1 => {
                    let removed = pd.remove(badge);
                    assert_eq!(removed.is_some(), live.remove(&capid));
                }
                _ => {
                    assert_eq!(pd.find(badge).is_some(), live.contains(&capid));
                }
            }
        }

        assert_eq!(pd.cap_count(), live.len());
        for capid in live {
            assert!(pd.find(Badge::from_raw(capid).unwrap()).is_some());
        }
    }
}
