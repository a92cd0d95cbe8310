//! Multi-node scenarios for HA services on an in-process partition
//!
//! Covers master election through joins and departures, per-member call
//! failures, notification fan-out, listener unregistration under membership
//! churn, and distributed state visibility.

use async_trait::async_trait;
use cohort_core::{Payload, PartitionConfig, ServiceKey, ViewId, DEFAULT_PARTITION_NAME};
use cohort_partition::{CallError, FaultMode, Invocation, LocalFabric, LocalPartition, Partition};
use cohort_replicants::ReplicantSnapshot;
use cohort_service::{
    HaService, HaServiceHandler, NotificationEvent, PartitionDirectory, PartitionServices,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const SERVICE: &str = "scheduler";

/// Service that answers `name` and `count` and records topology changes.
#[derive(Default)]
struct Recorder {
    node: String,
    calls: AtomicU64,
    views: Mutex<Vec<ViewId>>,
}

#[async_trait]
impl HaServiceHandler for Recorder {
    fn replicant_token(&self) -> Payload {
        Payload::from_bytes(self.node.as_bytes().to_vec())
    }

    async fn invoke(&self, invocation: Invocation) -> Result<Payload, CallError> {
        match invocation.method.as_str() {
            "name" => Ok(Payload::encode(&self.node)?),
            "count" => {
                let calls = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(Payload::encode(&calls)?)
            }
            other => Err(CallError::no_such_method(&invocation.service, other)),
        }
    }

    fn replicants_changed(&self, snapshot: &ReplicantSnapshot) {
        self.views.lock().push(snapshot.view_id);
    }
}

struct Node {
    partition: Arc<LocalPartition>,
    services: PartitionServices,
    service: HaService<Recorder>,
}

fn config() -> PartitionConfig {
    PartitionConfig::default().with_call_timeout(Duration::from_millis(100))
}

async fn node(fabric: &LocalFabric, name: &str) -> Node {
    let partition = fabric.join(name, config()).unwrap();
    let services = PartitionServices::start(partition.clone(), &config()).await.unwrap();
    let directory = PartitionDirectory::new();
    directory.register(services.clone());

    let recorder = Recorder {
        node: name.to_string(),
        ..Default::default()
    };
    let service = HaService::create(SERVICE, recorder, directory).unwrap();
    service.start().await.unwrap();
    Node {
        partition,
        services,
        service,
    }
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(40)).await;
}

fn masters(nodes: &[&Node]) -> Vec<String> {
    nodes
        .iter()
        .filter(|n| n.service.is_master_replica())
        .map(|n| n.service.handler().node.clone())
        .collect()
}

#[tokio::test]
async fn test_master_follows_join_order_through_departures() {
    let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
    let a = node(&fabric, "a").await;
    let b = node(&fabric, "b").await;
    let c = node(&fabric, "c").await;
    settle().await;

    assert_eq!(masters(&[&a, &b, &c]), vec!["a"]);
    let expected: Vec<_> = [&a, &b, &c].iter().map(|n| n.partition.local_member()).collect();
    for n in [&a, &b, &c] {
        assert_eq!(n.service.replicants().members(), expected);
    }

    c.partition.leave();
    settle().await;
    assert_eq!(masters(&[&a, &b, &c]), vec!["a"]);
    assert_eq!(b.service.replicants().len(), 2);

    let before = b.service.replicants().view_id;
    a.partition.leave();
    settle().await;
    assert_eq!(masters(&[&a, &b, &c]), vec!["b"]);
    let after = b.service.replicants();
    assert!(after.view_id > before);
    assert_eq!(after.tokens(), vec![Payload::from_bytes(b"b".to_vec())]);

    let views = b.service.handler().views.lock().clone();
    assert!(views.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(views.last(), Some(&after.view_id));
}

#[tokio::test]
async fn test_stopped_service_hands_over_mastership() {
    let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
    let a = node(&fabric, "a").await;
    let b = node(&fabric, "b").await;
    settle().await;

    a.service.stop().await.unwrap();
    assert_eq!(masters(&[&a, &b]), vec!["b"]);

    a.service.start().await.unwrap();
    settle().await;
    // Order follows partition join order, so the earliest member is master again.
    let members = b.service.replicants().members();
    assert_eq!(members, vec![a.partition.local_member(), b.partition.local_member()]);
    assert_eq!(masters(&[&a, &b]), vec!["a"]);
}

#[tokio::test]
async fn test_unresponsive_member_times_out_alone() {
    let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
    let a = node(&fabric, "a").await;
    let _b = node(&fabric, "b").await;
    let c = node(&fabric, "c").await;
    c.partition.set_fault(FaultMode::Unresponsive);

    let responses = a
        .service
        .call_method_on_partition("name", Payload::empty())
        .await
        .unwrap();

    let mut names: Vec<String> = responses
        .successes()
        .map(|(_, payload)| payload.decode().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a", "b"]);
    let failures: Vec<_> = responses.failures().collect();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0, &c.partition.local_member());
    assert_eq!(failures[0].1, &CallError::Timeout { after_ms: 100 });
    assert!(responses.into_payloads().is_err());
}

#[tokio::test]
async fn test_async_call_skips_caller() {
    let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
    let a = node(&fabric, "a").await;
    let b = node(&fabric, "b").await;

    a.service.call_async_method_on_partition("count", Payload::empty());
    settle().await;

    assert_eq!(a.service.handler().calls.load(Ordering::SeqCst), 0);
    assert_eq!(b.service.handler().calls.load(Ordering::SeqCst), 1);
}

fn collect_notifications(node: &Node) -> Arc<Mutex<Vec<NotificationEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    node.service
        .add_notification_listener(Arc::new(move |e: &NotificationEvent| sink.lock().push(e.clone())));
    seen
}

#[tokio::test]
async fn test_notification_reaches_every_member_once() {
    let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
    let a = node(&fabric, "a").await;
    let b = node(&fabric, "b").await;
    let (seen_a, seen_b) = (collect_notifications(&a), collect_notifications(&b));

    let sequence = a.service.next_sequence();
    a.service
        .send_notification(NotificationEvent::new("job-finished", sequence, Payload::empty()));
    settle().await;

    for seen in [&seen_a, &seen_b] {
        let events = seen.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].source, Some(ServiceKey::new(SERVICE)));
        assert_eq!(events[0].sequence, 1);
    }
}

#[tokio::test]
async fn test_notification_delivered_locally_when_transport_unavailable() {
    let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
    let a = node(&fabric, "a").await;
    let b = node(&fabric, "b").await;
    let (seen_a, seen_b) = (collect_notifications(&a), collect_notifications(&b));
    a.partition.set_fault(FaultMode::Unavailable);

    a.service
        .send_notification(NotificationEvent::new("job-finished", 1, Payload::empty()));
    settle().await;

    assert_eq!(seen_a.lock().len(), 1);
    assert!(seen_b.lock().is_empty());
}

#[tokio::test]
async fn test_remote_notification_is_not_forwarded_again() {
    let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
    let a = node(&fabric, "a").await;
    let b = node(&fabric, "b").await;
    let (seen_a, seen_b) = (collect_notifications(&a), collect_notifications(&b));

    b.service
        .receive_remote_notification(&NotificationEvent::new("external", 7, Payload::empty()));
    settle().await;

    assert_eq!(seen_b.lock().len(), 1);
    assert!(seen_a.lock().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_listener_call_after_remove_and_unregister_under_churn() {
    let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
    let a = node(&fabric, "a").await;
    let key = ServiceKey::new(SERVICE);

    let unregistered = Arc::new(AtomicBool::new(false));
    let violated = Arc::new(AtomicBool::new(false));
    let (flag, violation) = (Arc::clone(&unregistered), Arc::clone(&violated));
    let id = a.services.replicants.register_listener(
        key.clone(),
        Arc::new(move |_: &ReplicantSnapshot| {
            if flag.load(Ordering::SeqCst) {
                violation.store(true, Ordering::SeqCst);
            }
        }),
    );

    let churn_fabric = fabric.clone();
    let churn = tokio::spawn(async move {
        for round in 0..10 {
            let n = node(&churn_fabric, &format!("churn-{round}")).await;
            n.partition.leave();
        }
    });

    tokio::time::sleep(Duration::from_millis(5)).await;
    a.services.replicants.remove(&key).await.unwrap();
    assert!(a.services.replicants.unregister_listener(&key, id));
    unregistered.store(true, Ordering::SeqCst);

    churn.await.unwrap();
    settle().await;
    assert!(!violated.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_distributed_state_visible_at_once_and_replicated() {
    let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
    let a = node(&fabric, "a").await;
    let b = node(&fabric, "b").await;
    let key = ServiceKey::new(SERVICE);

    let state_a = a.service.distributed_state().unwrap();
    state_a.set_value(&key, "epoch", &3u32).unwrap();
    assert_eq!(state_a.get_value::<u32>(&key, "epoch").unwrap(), Some(3));

    settle().await;
    let state_b = b.service.distributed_state().unwrap();
    assert_eq!(state_b.get_value::<u32>(&key, "epoch").unwrap(), Some(3));
}

#[derive(Debug, Clone)]
enum Churn {
    Join,
    Leave(usize),
}

fn churn() -> impl Strategy<Value = Churn> {
    prop_oneof![Just(Churn::Join), (0usize..4).prop_map(Churn::Leave)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    #[test]
    fn test_single_master_after_membership_churn(ops in prop::collection::vec(churn(), 1..6)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
            let mut nodes = vec![node(&fabric, "seed").await];
            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    Churn::Join => nodes.push(node(&fabric, &format!("n{i}")).await),
                    Churn::Leave(idx) if !nodes.is_empty() => {
                        let gone = nodes.remove(idx % nodes.len());
                        gone.partition.leave();
                    }
                    Churn::Leave(_) => {}
                }
                settle().await;

                let refs: Vec<&Node> = nodes.iter().collect();
                let expected = usize::from(!nodes.is_empty());
                assert_eq!(masters(&refs).len(), expected);
                if let Some(first) = nodes.first() {
                    assert!(first.service.is_master_replica());
                }
            }
        });
    }
}
