//! Replicated key/value store
//!
//! Reads are served from the local map. Writes are applied locally first and
//! then cast to the other members, each of which keeps the write only if its
//! version beats what it already holds. A node that starts late pulls every
//! member's snapshot and merges it the same way.
//!
//! Listeners are never called with a key locked. Applied changes go through
//! one queue per node, drained by whichever thread finds it idle, so every
//! listener sees changes in the order they were applied and may write other
//! keys from its callback.

use crate::entry::{StateEntry, StateVersion, Versioned};
use crate::error::{Result, StateError};
use async_trait::async_trait;
use cohort_core::{Payload, ServiceKey};
use cohort_partition::{
    CallError, ClusterCall, Invocation, Partition, PartitionError, ServiceHandler,
};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Handler key distributed state instances talk to each other on.
pub const STATE_SERVICE: &str = "__state";

const METHOD_SET: &str = "set";
const METHOD_REMOVE: &str = "remove";
const METHOD_SNAPSHOT: &str = "snapshot";

/// Receives changes of the values in one service scope.
///
/// Called after the change is applied and its key unlocked, in the order
/// changes were applied on this node. Reading or writing any key from the
/// callback is allowed; a write made from the callback is delivered after the
/// current callback round returns.
pub trait StateListener: Send + Sync + 'static {
    /// `key` in `service` now holds `value` (`None` after a removal).
    fn value_changed(&self, service: &ServiceKey, key: &str, value: Option<&Payload>);
}

impl<F> StateListener for F
where
    F: Fn(&ServiceKey, &str, Option<&Payload>) + Send + Sync + 'static,
{
    fn value_changed(&self, service: &ServiceKey, key: &str, value: Option<&Payload>) {
        self(service, key, value);
    }
}

/// Handle returned by listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateListenerId(u64);

/// Lock for one (service, key); reentrant so listeners can read back.
type Cell = Arc<ReentrantMutex<RefCell<Option<Versioned>>>>;

type Listeners = Vec<(StateListenerId, Arc<dyn StateListener>)>;

/// Applied changes waiting for listener delivery.
#[derive(Default)]
struct Deliveries {
    queue: VecDeque<StateEntry>,
    draining: bool,
}

/// Distributed key/value state for one node.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct DistributedState {
    inner: Arc<StateInner>,
}

struct StateInner {
    partition: Arc<dyn Partition>,
    transfer_timeout: Duration,
    /// Lamport clock
    clock: AtomicU64,
    cells: RwLock<HashMap<ServiceKey, HashMap<String, Cell>>>,
    listeners: RwLock<HashMap<ServiceKey, Listeners>>,
    next_listener: AtomicU64,
    deliveries: Mutex<Deliveries>,
    handler: Mutex<Option<Arc<dyn ServiceHandler>>>,
}

impl DistributedState {
    /// State whose transfer on start uses the partition's call timeout.
    pub fn new(partition: Arc<dyn Partition>) -> Self {
        let timeout = partition.call_timeout();
        Self::with_transfer_timeout(partition, timeout)
    }

    /// State with an explicit per-member timeout for the transfer on start.
    pub fn with_transfer_timeout(partition: Arc<dyn Partition>, transfer_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(StateInner {
                partition,
                transfer_timeout,
                clock: AtomicU64::new(0),
                cells: RwLock::new(HashMap::new()),
                listeners: RwLock::new(HashMap::new()),
                next_listener: AtomicU64::new(1),
                deliveries: Mutex::new(Deliveries::default()),
                handler: Mutex::new(None),
            }),
        }
    }

    /// Whether `start` has completed and `stop` has not been called since.
    pub fn is_started(&self) -> bool {
        self.inner.handler.lock().is_some()
    }

    /// Register the peer handler and merge every other member's snapshot.
    /// Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.is_started() {
            return Ok(());
        }
        let handler: Arc<dyn ServiceHandler> = Arc::new(StateHandler {
            state: Arc::downgrade(&self.inner),
        });
        self.inner
            .partition
            .register_handler(ServiceKey::new(STATE_SERVICE), Arc::clone(&handler));
        *self.inner.handler.lock() = Some(handler);

        let merged = self.inner.pull_remote().await?;
        tracing::info!(
            partition = %self.inner.partition.name(),
            merged,
            "distributed state started"
        );
        Ok(())
    }

    /// Stop answering peers. Local values are kept.
    pub fn stop(&self) {
        if let Some(handler) = self.inner.handler.lock().take() {
            self.inner
                .partition
                .unregister_handler(&ServiceKey::new(STATE_SERVICE), &handler);
            tracing::info!(partition = %self.inner.partition.name(), "distributed state stopped");
        }
    }

    /// Store `value` under `(service, key)`.
    ///
    /// Visible to `get` on this node when this returns; other members receive
    /// it asynchronously.
    pub fn set(&self, service: &ServiceKey, key: &str, value: Payload) -> Result<()> {
        self.write(service, key, Some(value))
    }

    /// Remove `(service, key)`, returning the value it held.
    pub fn remove(&self, service: &ServiceKey, key: &str) -> Result<Option<Payload>> {
        let previous = self.get(service, key);
        if previous.is_some() {
            self.write(service, key, None)?;
        }
        Ok(previous)
    }

    /// Local value of `(service, key)`.
    pub fn get(&self, service: &ServiceKey, key: &str) -> Option<Payload> {
        let cell = self.inner.existing_cell(service, key)?;
        let guard = cell.lock();
        let value = guard.borrow().as_ref().and_then(|v| v.value.clone());
        value
    }

    /// Version of the write currently held for `(service, key)`, tombstones
    /// included.
    pub fn version(&self, service: &ServiceKey, key: &str) -> Option<StateVersion> {
        let cell = self.inner.existing_cell(service, key)?;
        let guard = cell.lock();
        let version = guard.borrow().as_ref().map(|v| v.version);
        version
    }

    /// Encode and store a typed value.
    pub fn set_value<T: Serialize>(&self, service: &ServiceKey, key: &str, value: &T) -> Result<()> {
        self.set(service, key, Payload::encode(value)?)
    }

    /// Decode a typed value.
    pub fn get_value<T: DeserializeOwned>(&self, service: &ServiceKey, key: &str) -> Result<Option<T>> {
        self.get(service, key)
            .map(|payload| {
                payload.decode().map_err(|err| StateError::Decode {
                    service: service.to_string(),
                    key: key.to_string(),
                    message: err.to_string(),
                })
            })
            .transpose()
    }

    /// Keys of `service` holding a value, sorted.
    pub fn keys(&self, service: &ServiceKey) -> Vec<String> {
        let mut keys: Vec<_> = self
            .inner
            .cells
            .read()
            .get(service)
            .map(|cells| {
                cells
                    .iter()
                    .filter(|(_, cell)| live(cell))
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Services with at least one value, sorted.
    pub fn services(&self) -> Vec<ServiceKey> {
        let mut services: Vec<_> = self
            .inner
            .cells
            .read()
            .iter()
            .filter(|(_, cells)| cells.values().any(live))
            .map(|(service, _)| service.clone())
            .collect();
        services.sort();
        services
    }

    /// Subscribe to value changes within `service`.
    pub fn register_listener(
        &self,
        service: ServiceKey,
        listener: Arc<dyn StateListener>,
    ) -> StateListenerId {
        let id = StateListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .write()
            .entry(service)
            .or_default()
            .push((id, listener));
        id
    }

    /// Remove a listener. Returns whether it was registered.
    pub fn unregister_listener(&self, service: &ServiceKey, id: StateListenerId) -> bool {
        let mut listeners = self.inner.listeners.write();
        let Some(list) = listeners.get_mut(service) else {
            return false;
        };
        let before = list.len();
        list.retain(|(l, _)| *l != id);
        list.len() != before
    }

    fn write(&self, service: &ServiceKey, key: &str, value: Option<Payload>) -> Result<()> {
        let inner = &self.inner;
        let entry = StateEntry {
            service: service.clone(),
            key: key.to_string(),
            value,
            version: StateVersion::new(inner.tick(), inner.partition.local_member().id),
        };
        let method = if entry.is_tombstone() {
            METHOD_REMOVE
        } else {
            METHOD_SET
        };
        let call = ClusterCall::new(STATE_SERVICE, method)
            .with_encoded(&entry)?
            .excluding_self();
        inner.merge(entry);

        match inner.partition.cast_on_cluster(call) {
            Ok(()) => Ok(()),
            Err(err @ (PartitionError::Disconnected { .. } | PartitionError::Unavailable { .. })) => {
                tracing::debug!(
                    service = %service,
                    key,
                    error = %err,
                    "state change kept local"
                );
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn live(cell: &Cell) -> bool {
    let guard = cell.lock();
    let live = guard.borrow().as_ref().is_some_and(|v| v.value.is_some());
    live
}

impl StateInner {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn observe(&self, clock: u64) {
        self.clock.fetch_max(clock, Ordering::SeqCst);
    }

    fn existing_cell(&self, service: &ServiceKey, key: &str) -> Option<Cell> {
        self.cells.read().get(service)?.get(key).cloned()
    }

    fn cell(&self, service: &ServiceKey, key: &str) -> Cell {
        if let Some(cell) = self.existing_cell(service, key) {
            return cell;
        }
        Arc::clone(
            self.cells
                .write()
                .entry(service.clone())
                .or_default()
                .entry(key.to_string())
                .or_default(),
        )
    }

    /// Keep `entry` if it beats the held version; notify listeners if so.
    fn merge(&self, entry: StateEntry) -> bool {
        self.observe(entry.version.clock);
        let cell = self.cell(&entry.service, &entry.key);
        let changed = {
            let guard = cell.lock();
            let changed = Versioned::merge(
                &mut guard.borrow_mut(),
                Versioned {
                    value: entry.value.clone(),
                    version: entry.version,
                },
            );
            if changed {
                tracing::debug!(
                    service = %entry.service,
                    key = %entry.key,
                    version = %entry.version,
                    removed = entry.is_tombstone(),
                    "state entry applied"
                );
                // Queued under the key's lock so one key's changes stay in
                // version order.
                self.deliveries.lock().queue.push_back(entry);
            }
            changed
        };
        if changed {
            self.drain();
        }
        changed
    }

    /// Deliver queued changes unless another call is already doing so.
    fn drain(&self) {
        {
            let mut deliveries = self.deliveries.lock();
            if deliveries.draining {
                return;
            }
            deliveries.draining = true;
        }
        loop {
            let next = {
                let mut deliveries = self.deliveries.lock();
                match deliveries.queue.pop_front() {
                    Some(entry) => entry,
                    None => {
                        deliveries.draining = false;
                        return;
                    }
                }
            };
            let listeners = self
                .listeners
                .read()
                .get(&next.service)
                .cloned()
                .unwrap_or_default();
            for (_, listener) in listeners {
                listener.value_changed(&next.service, &next.key, next.value.as_ref());
            }
        }
    }

    fn snapshot(&self) -> Vec<StateEntry> {
        let cells = self.cells.read();
        let mut entries = Vec::new();
        for (service, keys) in cells.iter() {
            for (key, cell) in keys {
                let guard = cell.lock();
                let held = guard.borrow();
                if let Some(held) = held.as_ref() {
                    entries.push(StateEntry {
                        service: service.clone(),
                        key: key.clone(),
                        value: held.value.clone(),
                        version: held.version,
                    });
                }
            }
        }
        entries
    }

    /// Merge every other member's snapshot; returns how many writes won.
    async fn pull_remote(&self) -> Result<usize> {
        let call = ClusterCall::new(STATE_SERVICE, METHOD_SNAPSHOT)
            .excluding_self()
            .with_timeout(self.transfer_timeout);
        let responses = match self.partition.call_on_cluster(call).await {
            Ok(responses) => responses,
            Err(PartitionError::Disconnected { .. } | PartitionError::Unavailable { .. }) => {
                return Ok(0)
            }
            Err(err) => return Err(err.into()),
        };

        let mut merged = 0;
        for response in responses.responses() {
            let entries = match &response.outcome {
                Ok(payload) => payload.decode::<Vec<StateEntry>>()?,
                Err(err) => {
                    tracing::debug!(member = %response.member, error = %err, "no state from member");
                    continue;
                }
            };
            for entry in entries {
                if self.merge(entry) {
                    merged += 1;
                }
            }
        }
        Ok(merged)
    }
}

/// Entry point for peers' state instances.
struct StateHandler {
    state: Weak<StateInner>,
}

#[async_trait]
impl ServiceHandler for StateHandler {
    async fn invoke(&self, invocation: Invocation) -> std::result::Result<Payload, CallError> {
        let Some(state) = self.state.upgrade() else {
            return Err(CallError::NoSuchService {
                service: invocation.service,
            });
        };
        match invocation.method.as_str() {
            METHOD_SET | METHOD_REMOVE => {
                let entry: StateEntry = invocation.args.decode()?;
                state.merge(entry);
                Ok(Payload::empty())
            }
            METHOD_SNAPSHOT => Ok(Payload::encode(&state.snapshot())?),
            other => Err(CallError::no_such_method(&invocation.service, other)),
        }
    }
}
