//! Per-key replicant state and its critical section
//!
//! Every mutation of a key's list and every listener (un)registration runs
//! under the slot's gate. Listener delivery happens inside the gate too, so a
//! listener that `unregister` has returned for can never be called again, and
//! listeners see snapshots in increasing view-id order.
//!
//! The gate is reentrant: a listener may query or unregister itself from inside
//! its callback on the same thread.
//!
//! Adds and removes arrive from peers in any order (pushed changes, retries,
//! state transfer replies). The slot remembers the highest revision applied
//! for each participation, removals included, and drops anything older.

use crate::types::{ListenerId, ReplicantEntry, ReplicantSnapshot, ReplicantsListener};
use cohort_core::{Member, MemberId, PartitionView, ServiceKey};
use parking_lot::{ReentrantMutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;

type Listeners = Vec<(ListenerId, Arc<dyn ReplicantsListener>)>;

struct SlotState {
    snapshot: ReplicantSnapshot,
    /// Highest revision applied per participation
    revisions: HashMap<Member, u64>,
}

pub(crate) struct KeySlot {
    gate: ReentrantMutex<()>,
    state: RwLock<SlotState>,
    listeners: RwLock<Listeners>,
}

impl KeySlot {
    pub(crate) fn new(service: ServiceKey) -> Self {
        Self {
            gate: ReentrantMutex::new(()),
            state: RwLock::new(SlotState {
                snapshot: ReplicantSnapshot::empty(service),
                revisions: HashMap::new(),
            }),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn snapshot(&self) -> ReplicantSnapshot {
        self.state.read().snapshot.clone()
    }

    pub(crate) fn entry_for(&self, id: MemberId) -> Option<ReplicantEntry> {
        self.state
            .read()
            .snapshot
            .entries
            .iter()
            .find(|e| e.member.id == id)
            .cloned()
    }

    pub(crate) fn add_listener(&self, id: ListenerId, listener: Arc<dyn ReplicantsListener>) {
        let _gate = self.gate.lock();
        self.listeners.write().push((id, listener));
    }

    pub(crate) fn remove_listener(&self, id: ListenerId) -> bool {
        let _gate = self.gate.lock();
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Insert or replace the entry of `entry.member.id`, provided `admit`
    /// accepts the member at the moment the gate is held and nothing newer
    /// was applied for the participation.
    pub(crate) fn upsert(
        &self,
        entry: ReplicantEntry,
        admit: impl FnOnce(&Member) -> bool,
    ) -> Option<ReplicantSnapshot> {
        self.update(|entries, revisions| {
            if !admit(&entry.member) {
                return false;
            }
            if revisions
                .get(&entry.member)
                .is_some_and(|&seen| entry.revision < seen)
            {
                return false;
            }
            revisions.insert(entry.member.clone(), entry.revision);
            if entries.contains(&entry) {
                return false;
            }
            entries.retain(|e| e.member.id != entry.member.id);
            entries.push(entry);
            true
        })
    }

    /// Drop the entry of exactly this participation unless an add newer than
    /// `revision` was applied. The removal is remembered either way, so an
    /// older add arriving later is ignored.
    pub(crate) fn remove_member(&self, member: &Member, revision: u64) -> Option<ReplicantSnapshot> {
        self.update(|entries, revisions| {
            let seen = revisions.entry(member.clone()).or_insert(0);
            if revision < *seen {
                return false;
            }
            *seen = revision;
            let before = entries.len();
            entries.retain(|e| &e.member != member);
            entries.len() != before
        })
    }

    /// Drop entries and revisions of members that are not in `view`.
    pub(crate) fn retain_view(&self, view: &PartitionView) -> Option<ReplicantSnapshot> {
        self.update(|entries, revisions| {
            revisions.retain(|member, _| view.contains(member));
            let before = entries.len();
            entries.retain(|e| view.contains(&e.member));
            entries.len() != before
        })
    }

    /// Apply `change` under the gate. When it reports a change, restore join
    /// order, bump the view id and notify listeners before releasing the gate.
    fn update(
        &self,
        change: impl FnOnce(&mut Vec<ReplicantEntry>, &mut HashMap<Member, u64>) -> bool,
    ) -> Option<ReplicantSnapshot> {
        let _gate = self.gate.lock();
        let snapshot = {
            let mut state = self.state.write();
            let SlotState {
                snapshot,
                revisions,
            } = &mut *state;
            let mut entries = snapshot.entries.clone();
            if !change(&mut entries, revisions) {
                return None;
            }
            entries.sort_by_key(|e| (e.member.join_seq, e.member.id));
            snapshot.entries = entries;
            snapshot.view_id = snapshot.view_id.next();
            snapshot.clone()
        };

        tracing::debug!(
            service = %snapshot.service,
            view = %snapshot.view_id,
            replicants = snapshot.len(),
            master = ?snapshot.master().map(ToString::to_string),
            "replicants recomputed"
        );
        self.notify(&snapshot);
        Some(snapshot)
    }

    fn notify(&self, snapshot: &ReplicantSnapshot) {
        let listeners = self.listeners.read().clone();
        for (id, listener) in listeners {
            // A listener earlier in this round may have unregistered this one.
            let registered = self.listeners.read().iter().any(|(l, _)| *l == id);
            if registered {
                listener.replicants_changed(snapshot);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::{JoinSeq, Payload, ViewId};
    use parking_lot::Mutex;
    use proptest::prelude::*;

    fn member(n: u128, seq: u64) -> Member {
        Member::new(MemberId::from_u128(n), JoinSeq(seq), format!("node-{n}"))
    }

    fn entry(member: Member, revision: u64) -> ReplicantEntry {
        ReplicantEntry {
            service: ServiceKey::new("svc"),
            member,
            token: Payload::empty(),
            revision,
        }
    }

    #[test]
    fn test_entries_kept_in_join_order() {
        let slot = KeySlot::new(ServiceKey::new("svc"));
        slot.upsert(entry(member(3, 30), 1), |_| true);
        slot.upsert(entry(member(1, 10), 1), |_| true);
        slot.upsert(entry(member(2, 20), 1), |_| true);

        let snapshot = slot.snapshot();
        let seqs: Vec<_> = snapshot.entries.iter().map(|e| e.member.join_seq.0).collect();
        assert_eq!(seqs, vec![10, 20, 30]);
        assert_eq!(snapshot.master(), Some(&member(1, 10)));
        assert_eq!(snapshot.view_id, ViewId(3));
    }

    #[test]
    fn test_identical_upsert_does_not_bump_view() {
        let slot = KeySlot::new(ServiceKey::new("svc"));
        assert!(slot.upsert(entry(member(1, 1), 1), |_| true).is_some());
        assert!(slot.upsert(entry(member(1, 1), 1), |_| true).is_none());
        assert_eq!(slot.snapshot().view_id, ViewId(1));
    }

    #[test]
    fn test_token_refresh_replaces_entry() {
        let slot = KeySlot::new(ServiceKey::new("svc"));
        slot.upsert(entry(member(1, 1), 1), |_| true);
        let mut refreshed = entry(member(1, 1), 2);
        refreshed.token = Payload::from_bytes(vec![7]);
        slot.upsert(refreshed.clone(), |_| true);

        assert_eq!(slot.snapshot().entries, vec![refreshed]);
    }

    #[test]
    fn test_rejected_member_not_added() {
        let slot = KeySlot::new(ServiceKey::new("svc"));
        assert!(slot.upsert(entry(member(1, 1), 1), |_| false).is_none());
        assert!(slot.snapshot().is_empty());
    }

    #[test]
    fn test_remove_requires_same_participation() {
        let slot = KeySlot::new(ServiceKey::new("svc"));
        slot.upsert(entry(member(1, 5), 1), |_| true);
        assert!(slot.remove_member(&member(1, 2), 2).is_none());
        assert!(slot.remove_member(&member(1, 5), 2).is_some());
        assert!(slot.snapshot().is_empty());
    }

    #[test]
    fn test_add_older_than_remove_is_ignored() {
        let slot = KeySlot::new(ServiceKey::new("svc"));
        // The removal lands before the add it supersedes.
        assert!(slot.remove_member(&member(1, 1), 4).is_none());
        assert!(slot.upsert(entry(member(1, 1), 3), |_| true).is_none());
        assert!(slot.snapshot().is_empty());

        assert!(slot.upsert(entry(member(1, 1), 5), |_| true).is_some());
        assert_eq!(slot.snapshot().members(), vec![member(1, 1)]);
    }

    #[test]
    fn test_remove_older_than_add_is_ignored() {
        let slot = KeySlot::new(ServiceKey::new("svc"));
        slot.upsert(entry(member(1, 1), 7), |_| true);
        assert!(slot.remove_member(&member(1, 1), 6).is_none());
        assert_eq!(slot.snapshot().len(), 1);
    }

    #[test]
    fn test_departure_forgets_revisions() {
        let slot = KeySlot::new(ServiceKey::new("svc"));
        slot.remove_member(&member(1, 1), 9);
        slot.retain_view(&PartitionView::new(ViewId(2), vec![member(2, 2)]));
        assert!(slot.upsert(entry(member(1, 1), 1), |_| true).is_some());
    }

    #[test]
    fn test_retain_view_prunes_departed() {
        let slot = KeySlot::new(ServiceKey::new("svc"));
        slot.upsert(entry(member(1, 1), 1), |_| true);
        slot.upsert(entry(member(2, 2), 1), |_| true);

        let view = PartitionView::new(ViewId(9), vec![member(2, 2)]);
        slot.retain_view(&view);
        assert_eq!(slot.snapshot().members(), vec![member(2, 2)]);
    }

    #[test]
    fn test_listener_sees_increasing_views_until_removed() {
        let slot = KeySlot::new(ServiceKey::new("svc"));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        slot.add_listener(
            ListenerId(1),
            Arc::new(move |s: &ReplicantSnapshot| sink.lock().push(s.view_id)),
        );

        slot.upsert(entry(member(1, 1), 1), |_| true);
        slot.upsert(entry(member(2, 2), 1), |_| true);
        assert!(slot.remove_listener(ListenerId(1)));
        slot.upsert(entry(member(3, 3), 1), |_| true);

        assert_eq!(*seen.lock(), vec![ViewId(1), ViewId(2)]);
        assert!(!slot.remove_listener(ListenerId(1)));
    }

    #[test]
    fn test_listener_unregistered_mid_round_is_skipped() {
        let slot = Arc::new(KeySlot::new(ServiceKey::new("svc")));
        let calls = Arc::new(Mutex::new(0u32));

        let inner = Arc::clone(&slot);
        slot.add_listener(
            ListenerId(1),
            Arc::new(move |_: &ReplicantSnapshot| {
                inner.remove_listener(ListenerId(2));
            }),
        );
        let counter = Arc::clone(&calls);
        slot.add_listener(
            ListenerId(2),
            Arc::new(move |_: &ReplicantSnapshot| *counter.lock() += 1),
        );

        slot.upsert(entry(member(1, 1), 1), |_| true);
        assert_eq!(*calls.lock(), 0);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Add(u8, u64),
        Remove(u8),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..6, 1u64..1000).prop_map(|(n, seq)| Op::Add(n, seq)),
            (0u8..6).prop_map(Op::Remove),
        ]
    }

    proptest! {
        #[test]
        fn test_fifo_invariant_holds_after_any_sequence(ops in prop::collection::vec(op(), 1..60)) {
            let slot = KeySlot::new(ServiceKey::new("svc"));
            let mut last_view = ViewId::INITIAL;
            for (revision, op) in (1u64..).zip(ops) {
                match op {
                    Op::Add(n, seq) => {
                        slot.upsert(entry(member(u128::from(n), seq), revision), |_| true);
                    }
                    Op::Remove(n) => {
                        if let Some(e) = slot.entry_for(MemberId::from_u128(u128::from(n))) {
                            slot.remove_member(&e.member, revision);
                        }
                    }
                }

                let snapshot = slot.snapshot();
                prop_assert!(snapshot.view_id >= last_view);
                last_view = snapshot.view_id;
                prop_assert!(snapshot
                    .entries
                    .windows(2)
                    .all(|w| w[0].member.join_seq <= w[1].member.join_seq));
                let mut ids: Vec<_> = snapshot.entries.iter().map(|e| e.member.id).collect();
                ids.sort();
                ids.dedup();
                prop_assert_eq!(ids.len(), snapshot.len());
                prop_assert_eq!(
                    snapshot.master(),
                    snapshot.entries.iter().map(|e| &e.member).min_by_key(|m| (m.join_seq, m.id))
                );
            }
        }
    }
}
