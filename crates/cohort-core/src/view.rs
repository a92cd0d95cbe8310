//! Membership snapshots
//!
//! A `PartitionView` is the immutable result of one membership change. Views are
//! replaced wholesale, never edited, so any holder can keep using an old one
//! without locks.

use crate::identifiers::{JoinSeq, MemberId, ViewId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A node's participation in a partition.
///
/// Identity is the pair of id and join sequence: the same node rejoining after
/// a departure is a different `Member`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    /// Node identity
    pub id: MemberId,
    /// Position in the partition's join order
    pub join_seq: JoinSeq,
    /// Human-readable node name, used in logs only
    pub name: String,
}

impl Member {
    /// Create a member record.
    pub fn new(id: MemberId, join_seq: JoinSeq, name: impl Into<String>) -> Self {
        Self {
            id,
            join_seq,
            name: name.into(),
        }
    }
}

impl fmt::Display for Member {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.name, self.join_seq)
    }
}

/// Immutable membership snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionView {
    /// Version of this snapshot
    pub view_id: ViewId,
    /// Members ordered by join sequence, earliest first
    members: Vec<Member>,
}

impl PartitionView {
    /// Build a view; members are sorted into join order.
    pub fn new(view_id: ViewId, mut members: Vec<Member>) -> Self {
        members.sort_by_key(|m| m.join_seq);
        Self { view_id, members }
    }

    /// View with no members.
    pub fn empty(view_id: ViewId) -> Self {
        Self {
            view_id,
            members: Vec::new(),
        }
    }

    /// Members in join order.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Whether this exact participation (id and join sequence) is present.
    pub fn contains(&self, member: &Member) -> bool {
        self.members
            .iter()
            .any(|m| m.id == member.id && m.join_seq == member.join_seq)
    }

    /// Current participation of a node, if it is in the view.
    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Earliest-joined member.
    pub fn coordinator(&self) -> Option<&Member> {
        self.members.first()
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the view has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members present here but not in `previous`, and members of `previous`
    /// that are gone.
    pub fn diff(&self, previous: &PartitionView) -> (Vec<Member>, Vec<Member>) {
        let joined = self
            .members
            .iter()
            .filter(|m| !previous.contains(m))
            .cloned()
            .collect();
        let left = previous
            .members
            .iter()
            .filter(|m| !self.contains(m))
            .cloned()
            .collect();
        (joined, left)
    }
}
