//! Object identities and identity references
//!
//! An [`Identity`] binds a kernel object to one of its external names. An
//! [`Oir`] (object-identity reference) is the per-PD capability record that
//! points at an identity. The identity holds a weak position in the middle:
//! the object owns its identities, identities never own their references,
//! and a reference never keeps an identity alive.
//!
//! Invalidation is a tombstone, not a free: after `invalidate`, every
//! reference derived from the identity still resolves in its PD tree but
//! reports no object. The PD must revoke the reference explicitly to
//! reclaim the badge.

use super::badge::{Badge, BadgeAllocator};
use super::object::{KernelObject, ObjectId, ObjectPayload};
use super::CapError;
use crate::pd::PdId;
use crate::sync::CapStoreLock;
use crate::Kernel;
use alloc::vec::Vec;
use hashbrown::HashMap;

/// Identity record identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IdentityId(pub(crate) u64);

impl IdentityId {
    /// Raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Object-identity reference: the per-PD capability record.
///
/// `in_utcb` counts in-flight message buffers that carry this capability;
/// a pinned reference cannot be revoked.
#[derive(Clone, Copy, Debug)]
pub struct Oir {
    pub(crate) capid: Badge,
    pub(crate) identity: IdentityId,
    pub(crate) in_utcb: u32,
}

impl Oir {
    /// The badge this reference is filed under.
    pub fn capid(&self) -> Badge {
        self.capid
    }

    /// The identity this reference points at.
    pub fn identity(&self) -> IdentityId {
        self.identity
    }

    /// Whether the reference is pinned by an in-flight message buffer.
    pub fn in_utcb(&self) -> bool {
        self.in_utcb > 0
    }
}

/// "This object, known by this name."
///
/// `object` is `None` exactly when the identity has been invalidated.
struct Identity {
    object: Option<ObjectId>,
    refs: Vec<(PdId, Badge)>,
}

struct StoreInner {
    objects: HashMap<ObjectId, KernelObject>,
    identities: HashMap<IdentityId, Identity>,
    next_object: u64,
    next_identity: u64,
}

/// Global store of kernel objects, identities and badges.
pub struct CapStore {
    pub(crate) badges: BadgeAllocator,
    inner: CapStoreLock<StoreInner>,
}

impl CapStore {
    /// Create a store whose badge range covers `badge_capacity` badges.
    pub fn new(badge_capacity: usize) -> Self {
        Self {
            badges: BadgeAllocator::new(badge_capacity),
            inner: CapStoreLock::new(StoreInner {
                objects: HashMap::new(),
                identities: HashMap::new(),
                next_object: 1,
                next_identity: 1,
            }),
        }
    }

    /// Register a new kernel object wrapping `payload`.
    pub fn new_object(&self, payload: ObjectPayload) -> ObjectId {
        let mut inner = self.inner.lock();
        let id = ObjectId(inner.next_object);
        inner.next_object += 1;
        inner.objects.insert(id, KernelObject::new(id, payload));
        log::trace!("new {} object {:?}", payload.type_name(), id);
        id
    }

    /// Payload of a registered object.
    pub fn payload(&self, id: ObjectId) -> Result<ObjectPayload, CapError> {
        self.inner
            .lock()
            .objects
            .get(&id)
            .map(|o| o.payload)
            .ok_or(CapError::ObjectNotFound)
    }

    /// Register a new identity for an already-constructed object.
    pub fn new_identity(&self, object: ObjectId) -> Result<IdentityId, CapError> {
        let mut inner = self.inner.lock();
        if !inner.objects.contains_key(&object) {
            return Err(CapError::ObjectNotFound);
        }
        let id = IdentityId(inner.next_identity);
        inner.next_identity += 1;
        inner.identities.insert(
            id,
            Identity {
                object: Some(object),
                refs: Vec::new(),
            },
        );
        if let Some(obj) = inner.objects.get_mut(&object) {
            obj.identities.push(id);
        }
        Ok(id)
    }

    /// Object behind an identity, `None` once the identity is invalidated
    /// or destroyed.
    pub fn identity_object(&self, id: IdentityId) -> Option<ObjectId> {
        self.inner.lock().identities.get(&id).and_then(|i| i.object)
    }

    /// Invalidate an identity: detach it from its object and tombstone it.
    ///
    /// Outstanding references stay findable in their PD trees but resolve
    /// to no object from now on.
    pub fn invalidate(&self, id: IdentityId) -> Result<(), CapError> {
        let mut inner = self.inner.lock();
        let object = match inner.identities.get_mut(&id) {
            None => return Err(CapError::UnknownIdentity),
            Some(identity) => identity.object.take(),
        };
        if let Some(oid) = object {
            if let Some(obj) = inner.objects.get_mut(&oid) {
                obj.identities.retain(|i| *i != id);
            }
        }
        Ok(())
    }

    /// Drop an identity record entirely.
    ///
    /// Implies invalidation; any remaining references behave as if the
    /// identity were merely invalidated.
    pub fn destroy_identity(&self, id: IdentityId) -> Result<(), CapError> {
        self.invalidate(id)?;
        self.inner.lock().identities.remove(&id);
        Ok(())
    }

    /// Destroy an object, invalidating every identity first.
    pub fn destroy_object(&self, id: ObjectId) -> Result<ObjectPayload, CapError> {
        let mut inner = self.inner.lock();
        let object = inner.objects.remove(&id).ok_or(CapError::ObjectNotFound)?;
        for identity in &object.identities {
            if let Some(record) = inner.identities.get_mut(identity) {
                record.object = None;
            }
        }
        log::trace!("destroyed {} object {:?}", object.payload.type_name(), id);
        Ok(object.payload)
    }

    /// Identities currently attached to an object.
    pub fn object_identities(&self, id: ObjectId) -> Vec<IdentityId> {
        self.inner
            .lock()
            .identities
            .iter()
            .filter(|(_, rec)| rec.object == Some(id))
            .map(|(iid, _)| *iid)
            .collect()
    }

    /// References currently derived from an identity.
    pub fn identity_refs(&self, id: IdentityId) -> Vec<(PdId, Badge)> {
        self.inner
            .lock()
            .identities
            .get(&id)
            .map(|i| i.refs.clone())
            .unwrap_or_default()
    }

    /// Record a reference on an identity, failing if the identity is gone
    /// or invalidated. Returns the freshly allocated badge.
    fn record_ref(&self, id: IdentityId, pd: PdId) -> Result<Badge, CapError> {
        let badge = self.badges.alloc()?;
        let mut inner = self.inner.lock();
        match inner.identities.get_mut(&id) {
            Some(identity) if identity.object.is_some() => {
                identity.refs.push((pd, badge));
                Ok(badge)
            }
            _ => {
                drop(inner);
                self.badges.free(badge);
                Err(CapError::IdentityInvalidated)
            }
        }
    }

    /// Forget a recorded reference. Tolerates an already-gone identity.
    pub(crate) fn unrecord_ref(&self, id: IdentityId, pd: PdId, badge: Badge) {
        let mut inner = self.inner.lock();
        if let Some(identity) = inner.identities.get_mut(&id) {
            identity.refs.retain(|r| *r != (pd, badge));
        }
    }

    /// Existing reference to `id` inside `pd`, if any.
    fn ref_in_pd(&self, id: IdentityId, pd: PdId) -> Option<Badge> {
        let inner = self.inner.lock();
        let identity = inner.identities.get(&id)?;
        identity
            .refs
            .iter()
            .find(|(owner, _)| *owner == pd)
            .map(|(_, badge)| *badge)
    }
}

/// Capability operations on the kernel facade.
impl Kernel {
    /// Export an object into a PD: fresh identity, fresh reference.
    ///
    /// This is the path a session-creation request takes when it hands a
    /// capability to a client.
    pub fn publish(&self, object: ObjectId, pd: PdId) -> Result<Badge, CapError> {
        let identity = self.caps.new_identity(object)?;
        self.new_reference(identity, pd)
    }

    /// Create a reference to `identity` inside `pd`.
    ///
    /// Fails gracefully if the identity has been invalidated concurrently.
    pub fn new_reference(&self, identity: IdentityId, pd: PdId) -> Result<Badge, CapError> {
        let badge = self.caps.record_ref(identity, pd)?;
        let pds = self.pds.read();
        let Some(pd_ref) = pds.get(&pd) else {
            drop(pds);
            self.caps.unrecord_ref(identity, pd, badge);
            self.caps.badges.free(badge);
            return Err(CapError::UnknownPd);
        };
        pd_ref.insert(Oir {
            capid: badge,
            identity,
            in_utcb: 0,
        });
        Ok(badge)
    }

    /// Delegate the capability `capid` of `src` into `dst`.
    ///
    /// The derived reference points at the same identity under a fresh
    /// badge. Fails if the identity was invalidated or the source
    /// capability was revoked mid-delegation.
    pub fn delegate(&self, src: PdId, capid: Badge, dst: PdId) -> Result<Badge, CapError> {
        let pds = self.pds.read();
        let src_pd = pds.get(&src).ok_or(CapError::UnknownPd)?;
        let dst_pd = pds.get(&dst).ok_or(CapError::UnknownPd)?;

        let identity = src_pd.find(capid).ok_or(CapError::UnknownCapability)?.identity;
        let badge = self.caps.record_ref(identity, dst)?;
        let oir = Oir {
            capid: badge,
            identity,
            in_utcb: 0,
        };

        // Re-check the source under the tree locks so a racing revocation
        // cannot leave us delegating a capability the source no longer
        // holds. Same-level locks are taken lower PdId first.
        let delegated = if src == dst {
            let mut tree = src_pd.tree.lock();
            tree.contains_key(&capid) && tree.insert(badge, oir).is_none()
        } else {
            let (first, second) = if src.0 < dst.0 {
                (src_pd, dst_pd)
            } else {
                (dst_pd, src_pd)
            };
            let first_guard = first.tree.lock();
            let second_guard = second.tree.lock();
            let (src_tree, mut dst_tree) = if src.0 < dst.0 {
                (first_guard, second_guard)
            } else {
                (second_guard, first_guard)
            };
            src_tree.contains_key(&capid) && dst_tree.insert(badge, oir).is_none()
        };
        drop(pds);

        if delegated {
            Ok(badge)
        } else {
            self.caps.unrecord_ref(identity, dst, badge);
            self.caps.badges.free(badge);
            Err(CapError::UnknownCapability)
        }
    }

    /// Revoke the capability `capid` held by `pd` and free its badge.
    ///
    /// Policy: a reference pinned by an in-flight message buffer is not
    /// destroyed; the call is refused with `InUseByUtcb` and must be
    /// retried after the buffer is acknowledged.
    pub fn revoke(&self, pd: PdId, capid: Badge) -> Result<(), CapError> {
        let pds = self.pds.read();
        let pd_ref = pds.get(&pd).ok_or(CapError::UnknownPd)?;
        let identity = {
            let mut tree = pd_ref.tree.lock();
            let oir = tree.get(&capid).ok_or(CapError::UnknownCapability)?;
            if oir.in_utcb > 0 {
                return Err(CapError::InUseByUtcb);
            }
            let identity = oir.identity;
            tree.remove(&capid);
            identity
        };
        drop(pds);
        self.caps.unrecord_ref(identity, pd, capid);
        self.caps.badges.free(capid);
        Ok(())
    }

    /// Look up the reference filed under `capid` in `pd`.
    pub fn find_cap(&self, pd: PdId, capid: Badge) -> Option<Oir> {
        self.pds.read().get(&pd)?.find(capid)
    }

    /// Object named by `capid` in `pd`, `None` after invalidation.
    pub fn object_of(&self, pd: PdId, capid: Badge) -> Option<ObjectId> {
        let oir = self.find_cap(pd, capid)?;
        self.caps.identity_object(oir.identity)
    }

    /// Typed payload lookup through a PD's capability tree.
    pub fn payload_of(&self, pd: PdId, capid: Badge) -> Result<ObjectPayload, CapError> {
        let oir = self.find_cap(pd, capid).ok_or(CapError::UnknownCapability)?;
        let object = self
            .caps
            .identity_object(oir.identity)
            .ok_or(CapError::IdentityInvalidated)?;
        self.caps.payload(object)
    }

    /// Badge under which `identity` is already known in `pd`, if any.
    ///
    /// Used to stamp the sender badge on IPC requests: the receiver sees
    /// the name it already holds, not the sender's.
    pub fn translate(&self, identity: IdentityId, pd: PdId) -> Option<Badge> {
        self.caps.ref_in_pd(identity, pd)
    }

    /// Pin `capid` for the duration of an in-flight message transfer.
    pub fn add_to_utcb(&self, pd: PdId, capid: Badge) -> Result<(), CapError> {
        self.with_oir(pd, capid, |oir| oir.in_utcb += 1)
    }

    /// Release an in-flight pin, as done by the acknowledging receiver.
    pub fn remove_from_utcb(&self, pd: PdId, capid: Badge) -> Result<(), CapError> {
        self.with_oir(pd, capid, |oir| {
            if oir.in_utcb == 0 {
                log::warn!("unbalanced utcb unpin of badge {}", capid.raw());
            } else {
                oir.in_utcb -= 1;
            }
        })
    }

    fn with_oir(
        &self,
        pd: PdId,
        capid: Badge,
        f: impl FnOnce(&mut Oir),
    ) -> Result<(), CapError> {
        let pds = self.pds.read();
        let pd_ref = pds.get(&pd).ok_or(CapError::UnknownPd)?;
        let mut tree = pd_ref.tree.lock();
        let oir = tree.get_mut(&capid).ok_or(CapError::UnknownCapability)?;
        f(oir);
        Ok(())
    }
}
