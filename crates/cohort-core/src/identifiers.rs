//! Identifier types
//!
//! Node identity, membership ordering and view versions. Join sequences and
//! view ids are only ever minted by a partition's membership authority; nothing
//! here derives them from wall-clock time.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque identity of a node in a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Create a random member identifier.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create a member identifier from a fixed value (deterministic tests, config).
    pub fn from_u128(value: u128) -> Self {
        Self(Uuid::from_u128(value))
    }

    /// Wrap an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Underlying UUID.
    pub fn uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let simple = self.0.simple().to_string();
        write!(f, "member-{}", &simple[simple.len() - 8..])
    }
}

/// Position of a member in the partition's join order.
///
/// Lower values joined earlier. A node that leaves and rejoins receives a new,
/// larger sequence number.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct JoinSeq(pub u64);

impl JoinSeq {
    /// Next sequence number.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for JoinSeq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic version of a membership or replicant view.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ViewId(pub u64);

impl ViewId {
    /// The view every list starts in before any recomputation.
    pub const INITIAL: Self = Self(0);

    /// Next view id.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Logical service name used to key handlers, replicant lists and state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ServiceKey(String);

impl ServiceKey {
    /// Create a service key.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Keys starting with `__` are reserved for partition infrastructure.
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with("__")
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ServiceKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ServiceKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for ServiceKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_id_display_is_short() {
        let id = MemberId::from_u128(0xabcdef12);
        assert_eq!(id.to_string(), "member-abcdef12");
    }

    #[test]
    fn test_member_id_roundtrips_uuid() {
        let uuid = Uuid::from_u128(7);
        assert_eq!(MemberId::from_uuid(uuid).uuid(), uuid);
    }

    #[test]
    fn test_sequence_and_view_ordering() {
        assert!(JoinSeq(1) < JoinSeq(1).next());
        assert_eq!(ViewId::INITIAL.next(), ViewId(1));
        assert_eq!(ViewId(3).to_string(), "v3");
    }

    #[test]
    fn test_reserved_service_keys() {
        assert!(ServiceKey::new("__replicants").is_reserved());
        assert!(!ServiceKey::from("scheduler").is_reserved());
    }
}
