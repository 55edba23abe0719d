//! Stable Identity
//!
//! The host may reuse or free the transient, in-memory representation of an
//! evaluated object between evaluations, so two unrelated placements can be
//! handed the same storage address within one cycle. Every identity and
//! grouping decision in this crate is therefore made on [`StableHandle`]s,
//! which are logical UUIDs owned by the host and never derived from addresses.

use std::fmt;

use uuid::Uuid;

/// Namespace for synthetic ids derived from a scatter parent.
const SCATTER_NAMESPACE: Uuid = Uuid::from_u128(0x6d69_7272_6f72_5f73_6361_7474_6572_0001);

/// Logical identity of a source-graph object, stable across re-evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StableHandle(Uuid);

impl StableHandle {
    /// Wraps a host-provided UUID.
    #[inline]
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Builds a handle from a raw 128-bit value.
    #[inline]
    #[must_use]
    pub const fn from_u128(raw: u128) -> Self {
        Self(Uuid::from_u128(raw))
    }

    /// Allocates a fresh random handle.
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Derives the id of the `index`-th procedural instance of this placement.
    ///
    /// The result is a name-based UUID of `(self, index)`, so it is identical
    /// across cycles as long as the instance count and ordering are stable.
    #[must_use]
    pub fn scatter_instance(self, index: u32) -> Self {
        let mut name = [0u8; 20];
        name[..16].copy_from_slice(self.0.as_bytes());
        name[16..].copy_from_slice(&index.to_le_bytes());
        Self(Uuid::new_v5(&SCATTER_NAMESPACE, &name))
    }

    #[inline]
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for StableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// Logical identity of a shareable geometry (the host's base object).
///
/// Placements with equal `GeometryId` are instances of one another.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GeometryId(pub StableHandle);

impl fmt::Display for GeometryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "geo:{}", self.0)
    }
}

/// Logical identity of a material resolved for one slot of a placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub StableHandle);

impl fmt::Display for MaterialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mat:{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scatter_ids_are_stable_and_distinct() {
        let parent = StableHandle::from_u128(42);
        assert_eq!(parent.scatter_instance(3), parent.scatter_instance(3));
        assert_ne!(parent.scatter_instance(3), parent.scatter_instance(4));
        assert_ne!(parent.scatter_instance(0), parent);
    }

    #[test]
    fn scatter_ids_depend_on_parent() {
        let a = StableHandle::from_u128(1);
        let b = StableHandle::from_u128(2);
        assert_ne!(a.scatter_instance(0), b.scatter_instance(0));
    }
}
