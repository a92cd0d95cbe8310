//! Per-node endpoint: handler table, worker permits and membership channels

use super::FaultMode;
use crate::error::CallError;
use crate::handler::{Invocation, ServiceHandler};
use cohort_core::{Member, MemberId, Payload, PartitionView, ServiceKey, ViewId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};

/// The receiving side of one node, shared between its `LocalPartition` and
/// the fabric.
pub(crate) struct NodeEndpoint {
    pub(crate) id: MemberId,
    pub(crate) name: String,
    handlers: RwLock<HashMap<ServiceKey, Arc<dyn ServiceHandler>>>,
    workers: Arc<Semaphore>,
    fault: RwLock<FaultMode>,
    views: watch::Sender<PartitionView>,
    /// `Some` while connected; the value is the current participation.
    participation: watch::Sender<Option<Member>>,
    last_member: RwLock<Option<Member>>,
}

impl NodeEndpoint {
    pub(crate) fn new(id: MemberId, name: String, max_concurrent_calls: usize) -> Self {
        let (views, _) = watch::channel(PartitionView::empty(ViewId::INITIAL));
        let (participation, _) = watch::channel(None);
        Self {
            id,
            name,
            handlers: RwLock::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(max_concurrent_calls)),
            fault: RwLock::new(FaultMode::Healthy),
            views,
            participation,
            last_member: RwLock::new(None),
        }
    }

    // -------------------------------------------------------------------------
    // Membership
    // -------------------------------------------------------------------------

    pub(crate) fn participation(&self) -> Option<Member> {
        self.participation.borrow().clone()
    }

    pub(crate) fn last_member(&self) -> Option<Member> {
        self.last_member.read().clone()
    }

    pub(crate) fn set_participation(&self, member: Option<Member>) {
        if let Some(member) = &member {
            *self.last_member.write() = Some(member.clone());
        }
        self.participation.send_replace(member);
    }

    pub(crate) fn publish_view(&self, view: PartitionView) {
        self.views.send_replace(view);
    }

    pub(crate) fn current_view(&self) -> PartitionView {
        self.views.borrow().clone()
    }

    pub(crate) fn subscribe_views(&self) -> watch::Receiver<PartitionView> {
        self.views.subscribe()
    }

    /// Resolves once `target` is no longer this node's participation.
    pub(crate) async fn departed(&self, target: Member) {
        let mut rx = self.participation.subscribe();
        let _ = rx.wait_for(|current| current.as_ref() != Some(&target)).await;
    }

    // -------------------------------------------------------------------------
    // Faults
    // -------------------------------------------------------------------------

    pub(crate) fn fault(&self) -> FaultMode {
        *self.fault.read()
    }

    pub(crate) fn set_fault(&self, mode: FaultMode) {
        *self.fault.write() = mode;
    }

    // -------------------------------------------------------------------------
    // Handlers
    // -------------------------------------------------------------------------

    pub(crate) fn register(&self, service: ServiceKey, handler: Arc<dyn ServiceHandler>) {
        self.handlers.write().insert(service, handler);
    }

    pub(crate) fn unregister(&self, service: &ServiceKey, handler: &Arc<dyn ServiceHandler>) -> bool {
        let mut handlers = self.handlers.write();
        match handlers.get(service) {
            Some(current) if Arc::ptr_eq(current, handler) => {
                handlers.remove(service);
                true
            }
            _ => false,
        }
    }

    fn handler(&self, service: &ServiceKey) -> Option<Arc<dyn ServiceHandler>> {
        self.handlers.read().get(service).cloned()
    }

    /// Run an invocation on a worker task of this node.
    ///
    /// Once the handler is found the invocation is queued for a worker and
    /// runs to completion even if the caller stops waiting for the reply.
    pub(crate) async fn execute(&self, invocation: Invocation) -> Result<Payload, CallError> {
        if self.fault() == FaultMode::Unresponsive {
            return std::future::pending().await;
        }

        let handler = self
            .handler(&invocation.service)
            .ok_or_else(|| CallError::NoSuchService {
                service: invocation.service.clone(),
            })?;

        let workers = Arc::clone(&self.workers);
        let task = tokio::spawn(async move {
            let _permit = workers
                .acquire_owned()
                .await
                .map_err(|_| CallError::MemberLeft)?;
            handler.invoke(invocation).await
        });

        match task.await {
            Ok(outcome) => outcome,
            Err(e) => Err(CallError::handler(format!("handler task aborted: {e}"))),
        }
    }
}
