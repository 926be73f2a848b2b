//! # Capability System
//!
//! Capability-based access control over kernel objects.
//!
//! ## Design
//!
//! A user-level caller never holds a pointer to a kernel object. It holds a
//! [`Badge`] - an opaque, unforgeable integer - that resolves inside its own
//! protection domain's capability tree to an object-identity reference,
//! which in turn resolves to an identity and finally to the object payload:
//!
//! ```text
//! Badge --(per-PD tree)--> Oir --(identity)--> KernelObject
//! ```
//!
//! The double indirection is what makes revocation cheap: invalidating one
//! identity makes every reference derived from it report "no object"
//! without visiting any of them.
//!
//! ## Enforced properties
//!
//! - **Badge uniqueness**: no two live capabilities share a badge.
//! - **Dangling safety**: references to an invalidated identity stay
//!   findable but resolve to nothing.
//! - **Pinned references**: a reference carried in an in-flight message
//!   buffer cannot be revoked until it is acknowledged.

mod badge;
pub mod identity;
mod object;

pub use badge::{Badge, BadgeAllocator, DEFAULT_BADGE_CAPACITY};
pub use identity::{CapStore, IdentityId, Oir};
pub use object::{KernelObject, ObjectId, ObjectPayload};

/// Capability-system errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    /// The badge range is exhausted.
    OutOfBadges,
    /// The object payload does not have the requested type.
    CannotCastToType,
    /// No object is registered under the given id.
    ObjectNotFound,
    /// No identity is registered under the given id.
    UnknownIdentity,
    /// The identity was invalidated before the operation could finish.
    IdentityInvalidated,
    /// No capability with the given badge exists in the protection domain.
    UnknownCapability,
    /// No protection domain with the given id exists.
    UnknownPd,
    /// The reference is pinned by an in-flight message buffer.
    InUseByUtcb,
}
