//! Partition name resolution
//!
//! An HA service names the partition it wants; the directory maps that name
//! to the node's partition handle plus the replicant manager and distributed
//! state running on it. One directory per process (or per simulated node),
//! passed explicitly.

use crate::error::{HaError, Result};
use cohort_core::PartitionConfig;
use cohort_partition::Partition;
use cohort_replicants::ReplicantManager;
use cohort_state::DistributedState;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-partition machinery shared by every HA service on a node.
#[derive(Clone)]
pub struct PartitionServices {
    /// Membership and call dispatch
    pub partition: Arc<dyn Partition>,
    /// Replicant lists for every service key
    pub replicants: ReplicantManager,
    /// Distributed key/value state
    pub state: DistributedState,
}

impl PartitionServices {
    /// Start a replicant manager and distributed state on `partition`.
    pub async fn start(partition: Arc<dyn Partition>, config: &PartitionConfig) -> Result<Self> {
        let timeout = config.state_transfer_timeout();
        let replicants = ReplicantManager::with_transfer_timeout(Arc::clone(&partition), timeout);
        let state = DistributedState::with_transfer_timeout(Arc::clone(&partition), timeout);
        replicants.start().await?;
        state.start().await?;
        Ok(Self {
            partition,
            replicants,
            state,
        })
    }

    /// Stop the replicant manager and distributed state.
    pub fn stop(&self) {
        self.state.stop();
        self.replicants.stop();
    }
}

/// Maps partition names to the node's partition services.
#[derive(Clone, Default)]
pub struct PartitionDirectory {
    partitions: Arc<RwLock<HashMap<String, PartitionServices>>>,
}

impl PartitionDirectory {
    /// Empty directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `services` under its partition's name, replacing any previous
    /// entry.
    pub fn register(&self, services: PartitionServices) {
        let name = services.partition.name().to_string();
        tracing::debug!(partition = %name, "partition registered");
        self.partitions.write().insert(name, services);
    }

    /// Remove a partition. Returns what was registered under the name.
    pub fn unregister(&self, name: &str) -> Option<PartitionServices> {
        self.partitions.write().remove(name)
    }

    /// Look up a partition by name.
    pub fn resolve(&self, name: &str) -> Result<PartitionServices> {
        self.partitions
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| HaError::PartitionNotFound {
                name: name.to_string(),
            })
    }

    /// Registered partition names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.partitions.read().keys().cloned().collect();
        names.sort();
        names
    }
}
