//! In-process partition fabric
//!
//! `LocalFabric` is the membership authority for a set of nodes living in one
//! process: it is the only place join sequence numbers and view ids are minted,
//! and it publishes every new view to all connected nodes while holding its
//! lock, so every node observes views in the same order.
//!
//! Calls are delivered by looking up the target's endpoint and running the
//! handler on one of that node's worker tasks. Fault injection (`FaultMode`)
//! lets tests make a node unresponsive or cut its outgoing transport.
//!
//! ```rust,no_run
//! use cohort_core::PartitionConfig;
//! use cohort_partition::{LocalFabric, Partition};
//!
//! # fn example() -> cohort_partition::Result<()> {
//! let fabric = LocalFabric::new("DefaultPartition");
//! let a = fabric.join("a", PartitionConfig::default())?;
//! let b = fabric.join("b", PartitionConfig::default())?;
//! assert_eq!(a.current_view().len(), 2);
//! b.leave();
//! # Ok(())
//! # }
//! ```

mod endpoint;
mod node;

pub use node::LocalPartition;

use crate::error::{PartitionError, Result};
use cohort_core::{CohortError, JoinSeq, Member, MemberId, PartitionConfig, PartitionView, ViewId};
use endpoint::NodeEndpoint;
use parking_lot::Mutex;
use std::sync::Arc;

/// Injected transport behaviour for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultMode {
    /// Normal operation
    #[default]
    Healthy,
    /// Incoming calls are accepted but never answered
    Unresponsive,
    /// Outgoing calls fail before anything is sent
    Unavailable,
}

/// Membership authority shared by all nodes of an in-process partition.
#[derive(Clone)]
pub struct LocalFabric {
    inner: Arc<FabricInner>,
}

struct FabricInner {
    name: String,
    state: Mutex<FabricState>,
}

struct FabricState {
    last_join_seq: JoinSeq,
    current: PartitionView,
    /// Connected nodes in join order
    nodes: Vec<Arc<NodeEndpoint>>,
}

impl LocalFabric {
    /// Create an empty partition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FabricInner {
                name: name.into(),
                state: Mutex::new(FabricState {
                    last_join_seq: JoinSeq::default(),
                    current: PartitionView::empty(ViewId::INITIAL),
                    nodes: Vec::new(),
                }),
            }),
        }
    }

    /// Partition name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Add a node with a fresh identity.
    pub fn join(
        &self,
        node_name: impl Into<String>,
        config: PartitionConfig,
    ) -> Result<Arc<LocalPartition>> {
        self.join_with_id(MemberId::new(), node_name, config)
    }

    /// Add a node with a caller-chosen identity.
    pub fn join_with_id(
        &self,
        id: MemberId,
        node_name: impl Into<String>,
        config: PartitionConfig,
    ) -> Result<Arc<LocalPartition>> {
        config.validate()?;
        if self.inner.state.lock().nodes.iter().any(|n| n.id == id) {
            return Err(PartitionError::Core(CohortError::invalid(format!(
                "{id} is already connected to {}",
                self.name()
            ))));
        }

        let endpoint = Arc::new(NodeEndpoint::new(
            id,
            node_name.into(),
            config.max_concurrent_calls,
        ));
        self.admit(&endpoint);
        Ok(Arc::new(LocalPartition::new(self.clone(), endpoint, config)))
    }

    /// Current membership as seen by the authority.
    pub fn view(&self) -> PartitionView {
        self.inner.state.lock().current.clone()
    }

    /// Remove a node as if it crashed. Returns whether it was connected.
    pub fn disconnect(&self, id: MemberId) -> bool {
        self.depart(id)
    }

    /// Change the transport behaviour of a connected node.
    pub fn set_fault(&self, id: MemberId, mode: FaultMode) -> bool {
        let state = self.inner.state.lock();
        match state.nodes.iter().find(|n| n.id == id) {
            Some(node) => {
                node.set_fault(mode);
                true
            }
            None => false,
        }
    }

    // -------------------------------------------------------------------------
    // Membership authority
    // -------------------------------------------------------------------------

    pub(crate) fn admit(&self, endpoint: &Arc<NodeEndpoint>) -> Member {
        let mut state = self.inner.state.lock();
        state.last_join_seq = state.last_join_seq.next();
        let member = Member::new(endpoint.id, state.last_join_seq, endpoint.name.clone());
        endpoint.set_participation(Some(member.clone()));
        state.nodes.push(Arc::clone(endpoint));
        self.publish(&mut state);
        tracing::info!(
            partition = %self.inner.name,
            member = %member,
            view = %state.current.view_id,
            "member joined"
        );
        member
    }

    pub(crate) fn depart(&self, id: MemberId) -> bool {
        let mut state = self.inner.state.lock();
        let Some(pos) = state.nodes.iter().position(|n| n.id == id) else {
            return false;
        };
        let endpoint = state.nodes.remove(pos);
        let member = endpoint.participation();
        endpoint.set_participation(None);
        self.publish(&mut state);
        // A node outside the partition sees nobody, itself included.
        endpoint.publish_view(PartitionView::empty(state.current.view_id));
        tracing::info!(
            partition = %self.inner.name,
            member = ?member.map(|m| m.to_string()),
            view = %state.current.view_id,
            "member left"
        );
        true
    }

    fn publish(&self, state: &mut FabricState) {
        let members = state
            .nodes
            .iter()
            .filter_map(|n| n.participation())
            .collect();
        state.current = PartitionView::new(state.current.view_id.next(), members);
        for node in &state.nodes {
            node.publish_view(state.current.clone());
        }
    }

    pub(crate) fn endpoint_for(&self, member: &Member) -> Option<Arc<NodeEndpoint>> {
        self.inner
            .state
            .lock()
            .nodes
            .iter()
            .find(|n| n.participation().as_ref() == Some(member))
            .cloned()
    }
}
