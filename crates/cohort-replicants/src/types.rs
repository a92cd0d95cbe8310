//! Replicant entries, versioned lists and listeners

use cohort_core::{Member, Payload, ServiceKey, ViewId};
use serde::{Deserialize, Serialize};

/// One member's participation in a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicantEntry {
    /// Service the member participates in
    pub service: ServiceKey,
    /// Participating member
    pub member: Member,
    /// Opaque token attached by the service
    pub token: Payload,
    /// Issuing node's counter for its adds and removes; a change carrying a
    /// lower revision than one already applied for the member is stale
    pub revision: u64,
}

/// A replicant list together with the view id that produced it.
///
/// Entries are ordered by the member's join sequence; the first entry is the
/// master replica.
///
/// `view_id` is a counter kept by each node for each key. It only increases
/// and moves on every change of the local list, but two nodes holding the
/// same list generally report different ids. Compare `entries` (or
/// [`ReplicantSnapshot::same_list`]) to check agreement across nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicantSnapshot {
    /// Service key
    pub service: ServiceKey,
    /// Version of this list on the local node
    pub view_id: ViewId,
    /// Entries in join order
    pub entries: Vec<ReplicantEntry>,
}

impl ReplicantSnapshot {
    /// List that has never been computed.
    pub fn empty(service: ServiceKey) -> Self {
        Self {
            service,
            view_id: ViewId::INITIAL,
            entries: Vec::new(),
        }
    }

    /// Member holding the master replica.
    pub fn master(&self) -> Option<&Member> {
        self.entries.first().map(|e| &e.member)
    }

    /// Participating members in order.
    pub fn members(&self) -> Vec<Member> {
        self.entries.iter().map(|e| e.member.clone()).collect()
    }

    /// Tokens in order.
    pub fn tokens(&self) -> Vec<Payload> {
        self.entries.iter().map(|e| e.token.clone()).collect()
    }

    /// Number of replicants.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nobody participates.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `other` lists the same participations in the same order,
    /// regardless of either node's view id.
    pub fn same_list(&self, other: &ReplicantSnapshot) -> bool {
        self.service == other.service && self.entries == other.entries
    }
}

/// Handle returned by listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Receives topology changes for one service key.
///
/// Called synchronously inside the key's critical section: snapshots arrive in
/// increasing view-id order and never after `unregister_listener` returns.
/// Implementations may query the manager but must not block on another task
/// that mutates the same key.
pub trait ReplicantsListener: Send + Sync + 'static {
    /// The replicant list for `snapshot.service` changed.
    fn replicants_changed(&self, snapshot: &ReplicantSnapshot);
}

impl<F> ReplicantsListener for F
where
    F: Fn(&ReplicantSnapshot) + Send + Sync + 'static,
{
    fn replicants_changed(&self, snapshot: &ReplicantSnapshot) {
        self(snapshot);
    }
}
