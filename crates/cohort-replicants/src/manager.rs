//! The replicant manager
//!
//! One `ReplicantManager` per node and partition. It owns the per-key slots,
//! the node's own participations, the `__replicants` handler through which
//! peers push adds and removes, and a watcher task that reapplies every new
//! partition view.
//!
//! Join order and master election need no extra protocol: every node sorts the
//! same entries by the join sequence the partition handed out, so once the
//! partition is quiet all nodes agree on the first entry.
//!
//! That only holds if every change reaches every member. A push that fails
//! at some member is retried against that member alone, with backoff, until
//! it lands, the member leaves the view, or a newer change of the same key
//! supersedes it. Every change carries a revision so retries, pushes and
//! state transfer replies can arrive in any order.

use crate::error::{ReplicantError, Result};
use crate::slot::KeySlot;
use crate::types::{ListenerId, ReplicantEntry, ReplicantSnapshot, ReplicantsListener};
use async_trait::async_trait;
use cohort_core::{Member, Payload, PartitionView, ServiceKey, ViewId};
use cohort_partition::{
    CallError, ClusterCall, Invocation, Partition, PartitionError, ServiceHandler,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

/// Handler key the managers of one partition talk to each other on.
pub const REPLICANTS_SERVICE: &str = "__replicants";

const METHOD_ADD: &str = "add";
const METHOD_REMOVE: &str = "remove";
const METHOD_LOCAL_REPLICANTS: &str = "local_replicants";

const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(20);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(1);

/// Distributed replicant manager for one node.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ReplicantManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    partition: Arc<dyn Partition>,
    transfer_timeout: Duration,
    slots: RwLock<HashMap<ServiceKey, Arc<KeySlot>>>,
    /// What this node contributes, by key
    local: RwLock<HashMap<ServiceKey, Contribution>>,
    next_revision: AtomicU64,
    /// Revision of the latest add or remove issued per key
    issued: Mutex<HashMap<ServiceKey, u64>>,
    /// Participation the local entries were last announced as
    announced_as: Mutex<Option<Member>>,
    next_listener: AtomicU64,
    running: Mutex<Option<Running>>,
}

struct Running {
    handler: Arc<dyn ServiceHandler>,
    watcher: JoinHandle<()>,
}

#[derive(Clone)]
struct Contribution {
    token: Payload,
    revision: u64,
}

/// One change of this node's participation, as pushed to peers.
#[derive(Debug, Clone)]
enum Change {
    Add(ReplicantEntry),
    Remove {
        service: ServiceKey,
        member: Member,
        revision: u64,
    },
}

impl Change {
    fn service(&self) -> &ServiceKey {
        match self {
            Change::Add(entry) => &entry.service,
            Change::Remove { service, .. } => service,
        }
    }

    fn member(&self) -> &Member {
        match self {
            Change::Add(entry) => &entry.member,
            Change::Remove { member, .. } => member,
        }
    }

    fn revision(&self) -> u64 {
        match self {
            Change::Add(entry) => entry.revision,
            Change::Remove { revision, .. } => *revision,
        }
    }

    fn call(&self) -> Result<ClusterCall> {
        let call = match self {
            Change::Add(entry) => ClusterCall::new(REPLICANTS_SERVICE, METHOD_ADD).with_encoded(entry)?,
            Change::Remove {
                service,
                member,
                revision,
            } => ClusterCall::new(REPLICANTS_SERVICE, METHOD_REMOVE)
                .with_encoded(&(service, member, revision))?,
        };
        Ok(call)
    }
}

/// First revision of a new manager. Starts above anything an earlier manager
/// on this node can have issued, so peers never mistake its changes for stale.
fn initial_revision() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1, |elapsed| u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX))
}

impl ReplicantManager {
    /// Manager whose state transfer uses the partition's call timeout.
    pub fn new(partition: Arc<dyn Partition>) -> Self {
        let timeout = partition.call_timeout();
        Self::with_transfer_timeout(partition, timeout)
    }

    /// Manager with an explicit per-member timeout for state transfer.
    pub fn with_transfer_timeout(partition: Arc<dyn Partition>, transfer_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                partition,
                transfer_timeout,
                slots: RwLock::new(HashMap::new()),
                local: RwLock::new(HashMap::new()),
                next_revision: AtomicU64::new(initial_revision()),
                issued: Mutex::new(HashMap::new()),
                announced_as: Mutex::new(None),
                next_listener: AtomicU64::new(1),
                running: Mutex::new(None),
            }),
        }
    }

    /// Partition this manager runs on.
    pub fn partition(&self) -> &Arc<dyn Partition> {
        &self.inner.partition
    }

    /// Whether `start` has completed and `stop` has not been called since.
    pub fn is_started(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Register the peer handler, pull existing participations from the other
    /// members and begin following partition views. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }
        let handler: Arc<dyn ServiceHandler> = Arc::new(ReplicantsHandler {
            manager: Arc::downgrade(&self.inner),
        });
        self.inner
            .partition
            .register_handler(ServiceKey::new(REPLICANTS_SERVICE), Arc::clone(&handler));

        let mut views = self.inner.partition.subscribe_views();
        let initial = views.borrow_and_update().clone();
        self.inner.synchronize(&initial).await;

        let weak = Arc::downgrade(&self.inner);
        let watcher = tokio::spawn(async move {
            while views.changed().await.is_ok() {
                let view = views.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else { break };
                inner.synchronize(&view).await;
            }
        });

        let mut running = self.inner.running.lock();
        if let Some(previous) = running.replace(Running { handler, watcher }) {
            // Lost a race with a concurrent start; keep the newer handler.
            previous.watcher.abort();
        }
        tracing::info!(
            partition = %self.inner.partition.name(),
            member = %self.inner.partition.local_member(),
            "replicant manager started"
        );
        Ok(())
    }

    /// Stop following views and answering peers. Lists and listeners are kept.
    pub fn stop(&self) {
        let Some(running) = self.inner.running.lock().take() else {
            return;
        };
        running.watcher.abort();
        self.inner
            .partition
            .unregister_handler(&ServiceKey::new(REPLICANTS_SERVICE), &running.handler);
        tracing::info!(partition = %self.inner.partition.name(), "replicant manager stopped");
    }

    /// Register (or refresh the token of) this node's participation in `service`.
    ///
    /// Local listeners are notified before the change is pushed to the other
    /// members; the call returns once every member replied or timed out.
    pub async fn add(&self, service: ServiceKey, token: Payload) -> Result<()> {
        self.ensure_started()?;
        let revision = self.inner.issue(&service);
        self.inner.local.write().insert(
            service.clone(),
            Contribution {
                token: token.clone(),
                revision,
            },
        );

        let partition = &self.inner.partition;
        if !partition.is_connected() {
            tracing::debug!(service = %service, "not connected, participation deferred until join");
            return Ok(());
        }
        let entry = ReplicantEntry {
            service,
            member: partition.local_member(),
            token,
            revision,
        };
        self.inner.slot(&entry.service).upsert(entry.clone(), |_| true);
        self.inner.announce(Change::Add(entry)).await
    }

    /// Withdraw this node's participation in `service`.
    ///
    /// Local listeners see the list without this node before `remove` returns.
    pub async fn remove(&self, service: &ServiceKey) -> Result<()> {
        self.ensure_started()?;
        if self.inner.local.write().remove(service).is_none() {
            return Ok(());
        }
        let revision = self.inner.issue(service);
        let member = self.inner.partition.local_member();
        if let Some(slot) = self.inner.existing_slot(service) {
            slot.remove_member(&member, revision);
        }
        if !self.inner.partition.is_connected() {
            return Ok(());
        }
        self.inner
            .announce(Change::Remove {
                service: service.clone(),
                member,
                revision,
            })
            .await
    }

    /// Subscribe to changes of one key's replicant list.
    pub fn register_listener(
        &self,
        service: ServiceKey,
        listener: Arc<dyn ReplicantsListener>,
    ) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner.slot(&service).add_listener(id, listener);
        id
    }

    /// Remove a listener. Once this returns the listener is never called again.
    pub fn unregister_listener(&self, service: &ServiceKey, id: ListenerId) -> bool {
        self.inner
            .existing_slot(service)
            .is_some_and(|slot| slot.remove_listener(id))
    }

    /// Whether this node currently holds the master replica of `service`.
    pub fn is_master_replica(&self, service: &ServiceKey) -> bool {
        let partition = &self.inner.partition;
        if !partition.is_connected() {
            return false;
        }
        let me = partition.local_member();
        self.snapshot(service).master() == Some(&me)
    }

    /// Current list and view id of `service`.
    pub fn snapshot(&self, service: &ServiceKey) -> ReplicantSnapshot {
        self.inner
            .existing_slot(service)
            .map(|slot| slot.snapshot())
            .unwrap_or_else(|| ReplicantSnapshot::empty(service.clone()))
    }

    /// Tokens of every replicant, master first.
    pub fn lookup_replicants(&self, service: &ServiceKey) -> Vec<Payload> {
        self.snapshot(service).tokens()
    }

    /// Members holding a replicant, master first.
    pub fn lookup_replicant_members(&self, service: &ServiceKey) -> Vec<Member> {
        self.snapshot(service).members()
    }

    /// Token this node contributes to `service`, if it participates.
    pub fn lookup_local_replicant(&self, service: &ServiceKey) -> Option<Payload> {
        self.inner
            .local
            .read()
            .get(service)
            .map(|contribution| contribution.token.clone())
    }

    /// Local view id of `service`'s list.
    pub fn view_id(&self, service: &ServiceKey) -> ViewId {
        self.snapshot(service).view_id
    }

    /// Keys with at least one replicant, sorted.
    pub fn service_keys(&self) -> Vec<ServiceKey> {
        let mut keys: Vec<_> = self
            .inner
            .slots
            .read()
            .iter()
            .filter(|(_, slot)| !slot.snapshot().is_empty())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn ensure_started(&self) -> Result<()> {
        if self.is_started() {
            Ok(())
        } else {
            Err(ReplicantError::NotStarted {
                partition: self.inner.partition.name().to_string(),
            })
        }
    }
}

impl ManagerInner {
    fn issue(&self, service: &ServiceKey) -> u64 {
        let revision = self.next_revision.fetch_add(1, Ordering::Relaxed);
        self.issued.lock().insert(service.clone(), revision);
        revision
    }

    fn slot(&self, service: &ServiceKey) -> Arc<KeySlot> {
        if let Some(slot) = self.existing_slot(service) {
            return slot;
        }
        Arc::clone(
            self.slots
                .write()
                .entry(service.clone())
                .or_insert_with(|| Arc::new(KeySlot::new(service.clone()))),
        )
    }

    fn existing_slot(&self, service: &ServiceKey) -> Option<Arc<KeySlot>> {
        self.slots.read().get(service).cloned()
    }

    fn local_entries(&self) -> Vec<ReplicantEntry> {
        if !self.partition.is_connected() {
            return Vec::new();
        }
        let member = self.partition.local_member();
        self.local
            .read()
            .iter()
            .map(|(service, contribution)| ReplicantEntry {
                service: service.clone(),
                member: member.clone(),
                token: contribution.token.clone(),
                revision: contribution.revision,
            })
            .collect()
    }

    /// Accept a peer's entry if its member is in the current view.
    fn apply_add(&self, entry: ReplicantEntry) {
        let slot = self.slot(&entry.service);
        slot.upsert(entry, |member| self.partition.current_view().contains(member));
    }

    /// Apply a peer's removal. The slot is created if needed so the removal
    /// is remembered even before the entry it removes arrives.
    fn apply_remove(&self, service: &ServiceKey, member: &Member, revision: u64) {
        self.slot(service).remove_member(member, revision);
    }

    /// Bring every list in line with `view`.
    ///
    /// Departed members are pruned. When the local participation is new (first
    /// start, or rejoin under a later join sequence) the other members' entries
    /// are pulled first and the local ones are re-announced after.
    async fn synchronize(self: &Arc<Self>, view: &PartitionView) {
        let slots: Vec<_> = self.slots.read().values().cloned().collect();
        for slot in slots {
            slot.retain_view(view);
        }

        let me = self.partition.local_member();
        {
            let mut announced = self.announced_as.lock();
            if !view.contains(&me) {
                *announced = None;
                return;
            }
            if announced.as_ref() == Some(&me) {
                return;
            }
            *announced = Some(me.clone());
        }

        tracing::debug!(
            partition = %self.partition.name(),
            member = %me,
            view = %view.view_id,
            "transferring replicant state"
        );
        self.pull_remote().await;
        for entry in self.local_entries() {
            self.slot(&entry.service).upsert(entry.clone(), |_| true);
            let service = entry.service.clone();
            if let Err(err) = self.announce(Change::Add(entry)).await {
                tracing::warn!(service = %service, error = %err, "re-announce failed");
            }
        }
    }

    async fn pull_remote(&self) {
        let call = ClusterCall::new(REPLICANTS_SERVICE, METHOD_LOCAL_REPLICANTS)
            .excluding_self()
            .with_timeout(self.transfer_timeout);
        let responses = match self.partition.call_on_cluster(call).await {
            Ok(responses) => responses,
            Err(err) => {
                tracing::debug!(error = %err, "replicant state transfer skipped");
                return;
            }
        };
        for response in responses.responses() {
            let entries = response
                .outcome
                .as_ref()
                .map_err(|err| err.to_string())
                .and_then(|payload| {
                    payload
                        .decode::<Vec<ReplicantEntry>>()
                        .map_err(|err| err.to_string())
                });
            match entries {
                Ok(entries) => entries.into_iter().for_each(|e| self.apply_add(e)),
                Err(error) => tracing::debug!(
                    member = %response.member,
                    error = %error,
                    "no replicant state from member"
                ),
            }
        }
    }

    /// Push a change to every other member and wait for them.
    ///
    /// Members that did not apply it get it again through `retry`; a node
    /// that cannot send at all has nothing to tell and is not an error.
    async fn announce(self: &Arc<Self>, change: Change) -> Result<()> {
        let call = change.call()?.excluding_self();
        match self.partition.call_on_cluster(call).await {
            Ok(responses) => {
                for (member, err) in responses.failures() {
                    if matches!(err, CallError::NoSuchService { .. }) {
                        // It pulls every participation when its manager starts.
                        tracing::debug!(member = %member, service = %change.service(), "member runs no replicant manager");
                        continue;
                    }
                    tracing::warn!(
                        member = %member,
                        service = %change.service(),
                        revision = change.revision(),
                        error = %err,
                        "replicant update not applied, retrying"
                    );
                    self.retry(member.clone(), change.clone());
                }
                Ok(())
            }
            Err(err @ (PartitionError::Disconnected { .. } | PartitionError::Unavailable { .. })) => {
                tracing::debug!(service = %change.service(), error = %err, "replicant update not sent");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Keep sending `change` to `target` until it is applied or no longer
    /// needed.
    fn retry(self: &Arc<Self>, target: Member, change: Change) {
        let manager = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut delay = RETRY_INITIAL_DELAY;
            loop {
                tokio::time::sleep(delay).await;
                let Some(inner) = manager.upgrade() else { return };
                if !inner.still_pending(&target, &change) {
                    return;
                }
                if inner.deliver(&target, &change).await {
                    tracing::debug!(
                        member = %target,
                        service = %change.service(),
                        revision = change.revision(),
                        "replicant update applied on retry"
                    );
                    return;
                }
                delay = (delay * 2).min(RETRY_MAX_DELAY);
            }
        });
    }

    /// Whether `change` is still the latest word of this node's current
    /// participation, and `target` still a member to tell it to.
    fn still_pending(&self, target: &Member, change: &Change) -> bool {
        self.running.lock().is_some()
            && self.partition.is_connected()
            && &self.partition.local_member() == change.member()
            && self.partition.current_view().contains(target)
            && self.issued.lock().get(change.service()) == Some(&change.revision())
    }

    /// One targeted attempt. True once the change needs no further sending.
    async fn deliver(&self, target: &Member, change: &Change) -> bool {
        let call = match change.call() {
            Ok(call) => call,
            Err(err) => {
                tracing::warn!(service = %change.service(), error = %err, "replicant update not encodable");
                return true;
            }
        };
        match self.partition.call_on_member(target, call).await {
            Ok(_)
            | Err(PartitionError::NotMember { .. })
            | Err(PartitionError::Call {
                source: CallError::NoSuchService { .. } | CallError::MemberLeft,
                ..
            }) => true,
            Err(err) => {
                tracing::debug!(member = %target, service = %change.service(), error = %err, "replicant update retry failed");
                false
            }
        }
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.watcher.abort();
            self.partition
                .unregister_handler(&ServiceKey::new(REPLICANTS_SERVICE), &running.handler);
        }
    }
}

/// Entry point for peers' managers.
struct ReplicantsHandler {
    manager: Weak<ManagerInner>,
}

#[async_trait]
impl ServiceHandler for ReplicantsHandler {
    async fn invoke(&self, invocation: Invocation) -> std::result::Result<Payload, CallError> {
        let Some(manager) = self.manager.upgrade() else {
            return Err(CallError::NoSuchService {
                service: invocation.service,
            });
        };
        match invocation.method.as_str() {
            METHOD_ADD => {
                let entry: ReplicantEntry = invocation.args.decode()?;
                manager.apply_add(entry);
                Ok(Payload::empty())
            }
            METHOD_REMOVE => {
                let (service, member, revision): (ServiceKey, Member, u64) = invocation.args.decode()?;
                manager.apply_remove(&service, &member, revision);
                Ok(Payload::empty())
            }
            METHOD_LOCAL_REPLICANTS => Ok(Payload::encode(&manager.local_entries())?),
            other => Err(CallError::no_such_method(&invocation.service, other)),
        }
    }
}
