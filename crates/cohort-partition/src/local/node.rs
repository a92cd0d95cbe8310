//! One node's handle on a `LocalFabric`

use super::endpoint::NodeEndpoint;
use super::{FaultMode, LocalFabric};
use crate::call::{ClusterCall, ClusterResponses, MemberResponse};
use crate::error::{CallError, PartitionError, Result};
use crate::handler::{Invocation, ServiceHandler};
use crate::partition::Partition;
use async_trait::async_trait;
use cohort_core::{JoinSeq, Member, Payload, PartitionConfig, PartitionView, ServiceKey};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// `Partition` implementation for a node connected to a `LocalFabric`.
pub struct LocalPartition {
    fabric: LocalFabric,
    endpoint: Arc<NodeEndpoint>,
    config: PartitionConfig,
}

impl LocalPartition {
    pub(crate) fn new(fabric: LocalFabric, endpoint: Arc<NodeEndpoint>, config: PartitionConfig) -> Self {
        Self {
            fabric,
            endpoint,
            config,
        }
    }

    /// Leave the partition gracefully. Returns whether the node was connected.
    pub fn leave(&self) -> bool {
        self.fabric.depart(self.endpoint.id)
    }

    /// Leave (if connected) and join again with a new, later join sequence.
    pub fn rejoin(&self) -> Member {
        self.fabric.depart(self.endpoint.id);
        self.fabric.admit(&self.endpoint)
    }

    /// Change this node's transport behaviour.
    pub fn set_fault(&self, mode: FaultMode) {
        self.endpoint.set_fault(mode);
    }

    /// Fabric this node belongs to.
    pub fn fabric(&self) -> &LocalFabric {
        &self.fabric
    }

    /// Node configuration.
    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    /// Participation to send as, or why nothing can be sent.
    fn sender(&self) -> Result<Member> {
        if self.endpoint.fault() == FaultMode::Unavailable {
            return Err(PartitionError::unavailable(self.fabric.name()));
        }
        self.endpoint
            .participation()
            .ok_or_else(|| PartitionError::disconnected(self.fabric.name()))
    }

    fn targets(&self, caller: &Member, call: &ClusterCall) -> Vec<Member> {
        self.endpoint
            .current_view()
            .members()
            .iter()
            .filter(|m| !(call.exclude_self && m.id == caller.id))
            .cloned()
            .collect()
    }
}

/// Deliver one invocation to one member, bounded by `timeout`.
async fn deliver(
    endpoint: Option<Arc<NodeEndpoint>>,
    target: Member,
    invocation: Invocation,
    timeout: Duration,
) -> std::result::Result<Payload, CallError> {
    let Some(endpoint) = endpoint else {
        return Err(CallError::MemberLeft);
    };
    let attempt = async {
        tokio::select! {
            outcome = endpoint.execute(invocation) => outcome,
            () = endpoint.departed(target) => Err(CallError::MemberLeft),
        }
    };
    let after_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    tokio::time::timeout(timeout, attempt)
        .await
        .unwrap_or(Err(CallError::Timeout { after_ms }))
}

/// Deliver to every target concurrently; responses keep target order.
async fn fan_out(
    fabric: LocalFabric,
    caller: Member,
    targets: Vec<Member>,
    call: ClusterCall,
    timeout: Duration,
) -> Vec<MemberResponse> {
    let deliveries = targets.into_iter().map(|member| {
        let endpoint = fabric.endpoint_for(&member);
        let invocation = Invocation {
            service: call.service.clone(),
            method: call.method.clone(),
            args: call.args.clone(),
            caller: caller.clone(),
        };
        async move {
            let outcome = deliver(endpoint, member.clone(), invocation, timeout).await;
            MemberResponse { member, outcome }
        }
    });
    join_all(deliveries).await
}

#[async_trait]
impl Partition for LocalPartition {
    fn name(&self) -> &str {
        self.fabric.name()
    }

    fn local_member(&self) -> Member {
        self.endpoint
            .last_member()
            .unwrap_or_else(|| Member::new(self.endpoint.id, JoinSeq::default(), self.endpoint.name.clone()))
    }

    fn is_connected(&self) -> bool {
        self.endpoint.participation().is_some()
    }

    fn current_view(&self) -> PartitionView {
        self.endpoint.current_view()
    }

    fn subscribe_views(&self) -> watch::Receiver<PartitionView> {
        self.endpoint.subscribe_views()
    }

    fn register_handler(&self, service: ServiceKey, handler: Arc<dyn ServiceHandler>) {
        tracing::debug!(partition = %self.fabric.name(), service = %service, "handler registered");
        self.endpoint.register(service, handler);
    }

    fn unregister_handler(&self, service: &ServiceKey, handler: &Arc<dyn ServiceHandler>) -> bool {
        let removed = self.endpoint.unregister(service, handler);
        tracing::debug!(
            partition = %self.fabric.name(),
            service = %service,
            removed,
            "handler unregistered"
        );
        removed
    }

    fn call_timeout(&self) -> Duration {
        self.config.call_timeout()
    }

    async fn call_on_cluster(&self, call: ClusterCall) -> Result<ClusterResponses> {
        let caller = self.sender()?;
        let timeout = call.timeout.unwrap_or_else(|| self.call_timeout());
        let targets = self.targets(&caller, &call);
        let (service, method) = (call.service.clone(), call.method.clone());

        let responses = fan_out(self.fabric.clone(), caller, targets, call, timeout).await;
        for response in &responses {
            if let Err(err) = &response.outcome {
                tracing::debug!(
                    service = %service,
                    method = %method,
                    member = %response.member,
                    error = %err,
                    "cluster call failed at member"
                );
            }
        }
        Ok(ClusterResponses::new(responses))
    }

    fn cast_on_cluster(&self, call: ClusterCall) -> Result<()> {
        let caller = self.sender()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| PartitionError::unavailable(self.fabric.name()))?;
        let timeout = call.timeout.unwrap_or_else(|| self.call_timeout());
        let targets = self.targets(&caller, &call);
        let fabric = self.fabric.clone();

        runtime.spawn(async move {
            let (service, method) = (call.service.clone(), call.method.clone());
            for response in fan_out(fabric, caller, targets, call, timeout).await {
                if let Err(err) = response.outcome {
                    tracing::debug!(
                        service = %service,
                        method = %method,
                        member = %response.member,
                        error = %err,
                        "asynchronous delivery dropped"
                    );
                }
            }
        });
        Ok(())
    }

    async fn call_on_member(&self, target: &Member, call: ClusterCall) -> Result<Payload> {
        let caller = self.sender()?;
        if !self.endpoint.current_view().contains(target) {
            return Err(PartitionError::NotMember { member: target.id });
        }
        let timeout = call.timeout.unwrap_or_else(|| self.call_timeout());
        let invocation = Invocation {
            service: call.service,
            method: call.method,
            args: call.args,
            caller,
        };
        deliver(self.fabric.endpoint_for(target), target.clone(), invocation, timeout)
            .await
            .map_err(|source| PartitionError::Call {
                member: target.id,
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ServiceHandler for Echo {
        async fn invoke(&self, invocation: Invocation) -> std::result::Result<Payload, CallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match invocation.method.as_str() {
                "echo" => Ok(invocation.args),
                "whoami" => Ok(Payload::encode(&invocation.caller.name)?),
                other => Err(CallError::no_such_method(&invocation.service, other)),
            }
        }
    }

    fn echo() -> Arc<Echo> {
        Arc::new(Echo {
            calls: AtomicUsize::new(0),
        })
    }

    fn config() -> PartitionConfig {
        PartitionConfig::default().with_call_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_call_reaches_every_member_once_including_self() {
        let fabric = LocalFabric::new("test");
        let nodes: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|n| fabric.join(*n, config()).unwrap())
            .collect();
        let handlers: Vec<_> = nodes
            .iter()
            .map(|node| {
                let handler = echo();
                node.register_handler(ServiceKey::new("svc"), handler.clone());
                handler
            })
            .collect();

        let call = ClusterCall::new("svc", "echo").with_encoded(&42u32).unwrap();
        let responses = nodes[0].call_on_cluster(call).await.unwrap();

        assert_eq!(responses.len(), 3);
        assert!(responses.all_succeeded());
        for handler in &handlers {
            assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        }
        let values: Vec<u32> = responses
            .into_payloads()
            .unwrap()
            .iter()
            .map(|p| p.decode().unwrap())
            .collect();
        assert_eq!(values, vec![42, 42, 42]);
    }

    #[tokio::test]
    async fn test_exclude_self_skips_caller() {
        let fabric = LocalFabric::new("test");
        let a = fabric.join("a", config()).unwrap();
        let b = fabric.join("b", config()).unwrap();
        let (ha, hb) = (echo(), echo());
        a.register_handler(ServiceKey::new("svc"), ha.clone());
        b.register_handler(ServiceKey::new("svc"), hb.clone());

        let responses = a
            .call_on_cluster(ClusterCall::new("svc", "whoami").excluding_self())
            .await
            .unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(ha.calls.load(Ordering::SeqCst), 0);
        assert_eq!(hb.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_handler_reported_per_member() {
        let fabric = LocalFabric::new("test");
        let a = fabric.join("a", config()).unwrap();
        let _b = fabric.join("b", config()).unwrap();
        a.register_handler(ServiceKey::new("svc"), echo());

        let responses = a.call_on_cluster(ClusterCall::new("svc", "echo")).await.unwrap();
        let failures: Vec<_> = responses.failures().map(|(_, e)| e.clone()).collect();
        assert_eq!(
            failures,
            vec![CallError::NoSuchService {
                service: ServiceKey::new("svc")
            }]
        );
    }

    #[tokio::test]
    async fn test_unresponsive_member_times_out_alone() {
        let fabric = LocalFabric::new("test");
        let nodes: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|n| fabric.join(*n, config()).unwrap())
            .collect();
        for node in &nodes {
            node.register_handler(ServiceKey::new("svc"), echo());
        }
        nodes[2].set_fault(FaultMode::Unresponsive);

        let call = ClusterCall::new("svc", "echo").with_timeout(Duration::from_millis(50));
        let responses = nodes[0].call_on_cluster(call).await.unwrap();
        assert_eq!(responses.successes().count(), 2);
        let failures: Vec<_> = responses.failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, &nodes[2].local_member());
        assert_eq!(failures[0].1, &CallError::Timeout { after_ms: 50 });
    }

    #[tokio::test]
    async fn test_departure_during_call_is_member_failure() {
        let fabric = LocalFabric::new("test");
        let a = fabric.join("a", config()).unwrap();
        let b = fabric.join("b", config()).unwrap();
        a.register_handler(ServiceKey::new("svc"), echo());
        b.register_handler(ServiceKey::new("svc"), echo());
        b.set_fault(FaultMode::Unresponsive);

        let leaver = Arc::clone(&b);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            leaver.leave();
        });

        let responses = a
            .call_on_cluster(ClusterCall::new("svc", "echo").with_timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        let failures: Vec<_> = responses.failures().map(|(_, e)| e.clone()).collect();
        assert_eq!(failures, vec![CallError::MemberLeft]);
        assert_eq!(responses.successes().count(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_node_cannot_send() {
        let fabric = LocalFabric::new("test");
        let a = fabric.join("a", config()).unwrap();
        a.leave();

        let err = a.call_on_cluster(ClusterCall::new("svc", "echo")).await.unwrap_err();
        assert!(matches!(err, PartitionError::Disconnected { .. }));
        assert!(a.cast_on_cluster(ClusterCall::new("svc", "echo")).is_err());
    }

    #[tokio::test]
    async fn test_unavailable_transport_rejects_cast() {
        let fabric = LocalFabric::new("test");
        let a = fabric.join("a", config()).unwrap();
        a.set_fault(FaultMode::Unavailable);
        assert!(matches!(
            a.cast_on_cluster(ClusterCall::new("svc", "echo")),
            Err(PartitionError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_call_on_member_targets_one_node() {
        let fabric = LocalFabric::new("test");
        let a = fabric.join("a", config()).unwrap();
        let b = fabric.join("b", config()).unwrap();
        b.register_handler(ServiceKey::new("svc"), echo());

        let reply = a
            .call_on_member(&b.local_member(), ClusterCall::new("svc", "whoami"))
            .await
            .unwrap();
        assert_eq!(reply.decode::<String>().unwrap(), "a");

        let err = a
            .call_on_member(&b.local_member(), ClusterCall::new("svc", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PartitionError::Call {
                source: CallError::NoSuchMethod { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_unregister_requires_same_handler() {
        let fabric = LocalFabric::new("test");
        let a = fabric.join("a", config()).unwrap();
        let first: Arc<dyn ServiceHandler> = echo();
        let second: Arc<dyn ServiceHandler> = echo();
        a.register_handler(ServiceKey::new("svc"), first.clone());
        a.register_handler(ServiceKey::new("svc"), second.clone());

        assert!(!a.unregister_handler(&ServiceKey::new("svc"), &first));
        assert!(a.unregister_handler(&ServiceKey::new("svc"), &second));
    }

    struct Slow {
        completed: AtomicUsize,
    }

    #[async_trait]
    impl ServiceHandler for Slow {
        async fn invoke(&self, _invocation: Invocation) -> std::result::Result<Payload, CallError> {
            tokio::time::sleep(Duration::from_millis(60)).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            Ok(Payload::empty())
        }
    }

    #[tokio::test]
    async fn test_accepted_invocation_completes_after_caller_timeout() {
        let fabric = LocalFabric::new("test");
        let a = fabric.join("a", config()).unwrap();
        let single_worker = PartitionConfig {
            max_concurrent_calls: 1,
            ..config()
        };
        let b = fabric.join("b", single_worker).unwrap();
        let slow = Arc::new(Slow {
            completed: AtomicUsize::new(0),
        });
        b.register_handler(ServiceKey::new("svc"), slow.clone());
        let target = b.local_member();

        let busy = Arc::clone(&a);
        let holder = target.clone();
        let first = tokio::spawn(async move {
            busy.call_on_member(&holder, ClusterCall::new("svc", "work")).await
        });
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = a
            .call_on_member(
                &target,
                ClusterCall::new("svc", "work").with_timeout(Duration::from_millis(20)),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PartitionError::Call {
                source: CallError::Timeout { after_ms: 20 },
                ..
            }
        ));

        assert!(first.await.unwrap().is_ok());
        for _ in 0..100 {
            if slow.completed.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(slow.completed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cast_delivers_without_waiting() {
        let fabric = LocalFabric::new("test");
        let a = fabric.join("a", config()).unwrap();
        let b = fabric.join("b", config()).unwrap();
        let hb = echo();
        b.register_handler(ServiceKey::new("svc"), hb.clone());

        a.cast_on_cluster(ClusterCall::new("svc", "echo").excluding_self())
            .unwrap();
        for _ in 0..50 {
            if hb.calls.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(hb.calls.load(Ordering::SeqCst), 1);
    }
}
