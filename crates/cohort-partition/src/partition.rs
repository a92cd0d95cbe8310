//! The partition contract
//!
//! Everything above this crate (replicant manager, distributed state, HA
//! services) talks to the group only through `Partition`. Implementations own
//! membership truth and the handler table for their node.

use crate::call::{ClusterCall, ClusterResponses};
use crate::error::Result;
use crate::handler::ServiceHandler;
use async_trait::async_trait;
use cohort_core::{Member, Payload, PartitionView, ServiceKey};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Group membership and call dispatch for one node.
#[async_trait]
pub trait Partition: Send + Sync + 'static {
    /// Partition name.
    fn name(&self) -> &str;

    /// This node's current (or most recent) participation.
    fn local_member(&self) -> Member;

    /// Whether this node is currently in the partition.
    fn is_connected(&self) -> bool;

    /// Last known membership snapshot. Never blocks.
    fn current_view(&self) -> PartitionView;

    /// Stream of membership snapshots; intermediate views may be coalesced.
    fn subscribe_views(&self) -> watch::Receiver<PartitionView>;

    /// Bind a handler to a service key on this node, replacing any previous one.
    fn register_handler(&self, service: ServiceKey, handler: Arc<dyn ServiceHandler>);

    /// Remove the handler if it is still the one bound to the key.
    ///
    /// Returns whether a handler was removed.
    fn unregister_handler(&self, service: &ServiceKey, handler: &Arc<dyn ServiceHandler>) -> bool;

    /// Default per-member timeout for synchronous calls.
    fn call_timeout(&self) -> Duration;

    /// Invoke on every current member and wait for each reply or timeout.
    ///
    /// Per-member failures (missing handler, timeout, departure) are reported in
    /// the responses and never fail the whole call.
    async fn call_on_cluster(&self, call: ClusterCall) -> Result<ClusterResponses>;

    /// Invoke on every current member without waiting.
    ///
    /// Fails only when nothing can be sent at all; delivery failures at
    /// individual members are logged and dropped.
    fn cast_on_cluster(&self, call: ClusterCall) -> Result<()>;

    /// Invoke on one member and wait for its reply.
    async fn call_on_member(&self, target: &Member, call: ClusterCall) -> Result<Payload>;
}
