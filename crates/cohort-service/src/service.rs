//! The HA service façade
//!
//! `HaService` binds a concrete service (`HaServiceHandler`) to a partition:
//! on start it registers the service's call handler, subscribes the service to
//! its replicant list and contributes the node's token; on stop it undoes the
//! three steps in reverse. While started it offers cluster-wide calls and
//! notification fan-out scoped to the service's key.

use crate::directory::{PartitionDirectory, PartitionServices};
use crate::error::{HaError, Result};
use crate::lifecycle::ServiceState;
use crate::notification::{
    NotificationEvent, NotificationListener, NotificationListenerId, NotificationListeners,
    RECEIVE_REMOTE_NOTIFICATION,
};
use async_trait::async_trait;
use cohort_core::{CohortError, Payload, ServiceKey, DEFAULT_PARTITION_NAME};
use cohort_partition::{
    CallError, ClusterCall, ClusterResponses, Invocation, Partition, ServiceHandler,
};
use cohort_replicants::{ListenerId, ReplicantSnapshot};
use cohort_state::DistributedState;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// The concrete service plugged into an `HaService`.
#[async_trait]
pub trait HaServiceHandler: Send + Sync + 'static {
    /// Token this node contributes to the service's replicant list.
    fn replicant_token(&self) -> Payload {
        Payload::empty()
    }

    /// A method invoked through `call_method_on_partition` or
    /// `call_async_method_on_partition` on some member.
    async fn invoke(&self, invocation: Invocation) -> std::result::Result<Payload, CallError> {
        Err(CallError::no_such_method(&invocation.service, invocation.method))
    }

    /// The replicant list of this service changed.
    ///
    /// Runs inside the replicant manager's critical section for the key; use
    /// `HaService::is_master_replica` to decide whether to act. The service is
    /// already bound when the first call arrives during `start`.
    fn replicants_changed(&self, snapshot: &ReplicantSnapshot) {
        let _ = snapshot;
    }
}

/// HA service bound to one partition.
///
/// Cheap to clone; clones share state.
pub struct HaService<H: HaServiceHandler> {
    inner: Arc<ServiceInner<H>>,
}

impl<H: HaServiceHandler> Clone for HaService<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ServiceInner<H> {
    key: ServiceKey,
    handler: Arc<H>,
    directory: PartitionDirectory,
    partition_name: RwLock<String>,
    state: RwLock<ServiceState>,
    /// Partition the service is bound to; set before the first registration
    /// in `start`, cleared after the last deregistration in `stop`
    services: RwLock<Option<PartitionServices>>,
    binding: Mutex<Option<Binding>>,
    notifications: NotificationListeners,
    sequence: AtomicU64,
}

/// What start registered, so stop can undo exactly that.
struct Binding {
    services: PartitionServices,
    dispatcher: Arc<dyn ServiceHandler>,
    listener: ListenerId,
}

impl<H: HaServiceHandler> HaService<H> {
    /// Create a service named `name`, bound to the default partition.
    pub fn create(name: impl Into<String>, handler: H, directory: PartitionDirectory) -> Result<Self> {
        let key = ServiceKey::new(name);
        if key.as_str().is_empty() || key.is_reserved() {
            return Err(CohortError::invalid(format!("service name {key:?} is not usable")).into());
        }
        tracing::debug!(service = %key, "service created");
        Ok(Self {
            inner: Arc::new(ServiceInner {
                key,
                handler: Arc::new(handler),
                directory,
                partition_name: RwLock::new(DEFAULT_PARTITION_NAME.to_string()),
                state: RwLock::new(ServiceState::Created),
                services: RwLock::new(None),
                binding: Mutex::new(None),
                notifications: NotificationListeners::default(),
                sequence: AtomicU64::new(0),
            }),
        })
    }

    /// Service key used for the handler, the replicant list and notifications.
    pub fn service_key(&self) -> &ServiceKey {
        &self.inner.key
    }

    /// The concrete service.
    pub fn handler(&self) -> &Arc<H> {
        &self.inner.handler
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ServiceState {
        *self.inner.state.read()
    }

    /// Name of the partition the service binds to on start.
    pub fn partition_name(&self) -> String {
        self.inner.partition_name.read().clone()
    }

    /// Bind to a different partition on the next start.
    pub fn set_partition_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        let state = self.inner.state.read();
        if !state.can_rebind() {
            return Err(self.invalid(*state, "rebind"));
        }
        if name.is_empty() {
            return Err(CohortError::configuration("partition name must not be empty").into());
        }
        *self.inner.partition_name.write() = name;
        Ok(())
    }

    /// Register with the partition and the replicant manager.
    ///
    /// Order: resolve the partition, register the call handler, register the
    /// replicant listener, add this node's replicant. Any failure undoes the
    /// steps already taken and leaves the service `Failed`.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            match *state {
                ServiceState::Started => return Ok(()),
                s if s.can_start() => *state = ServiceState::Starting,
                s => return Err(self.invalid(s, "start")),
            }
        }

        match self.bind().await {
            Ok(binding) => {
                *self.inner.binding.lock() = Some(binding);
                self.set_state(ServiceState::Started);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(service = %self.inner.key, error = %err, "service start failed");
                *self.inner.services.write() = None;
                self.set_state(ServiceState::Failed);
                Err(err)
            }
        }
    }

    async fn bind(&self) -> Result<Binding> {
        let key = &self.inner.key;
        let services = self.inner.directory.resolve(&self.partition_name())?;
        *self.inner.services.write() = Some(services.clone());

        let dispatcher: Arc<dyn ServiceHandler> = Arc::new(Dispatcher {
            service: Arc::downgrade(&self.inner),
        });
        services
            .partition
            .register_handler(key.clone(), Arc::clone(&dispatcher));

        let handler = Arc::clone(&self.inner.handler);
        let listener = services.replicants.register_listener(
            key.clone(),
            Arc::new(move |snapshot: &ReplicantSnapshot| handler.replicants_changed(snapshot)),
        );

        if let Err(err) = services
            .replicants
            .add(key.clone(), self.inner.handler.replicant_token())
            .await
        {
            services.replicants.unregister_listener(key, listener);
            services.partition.unregister_handler(key, &dispatcher);
            return Err(err.into());
        }

        tracing::info!(
            service = %key,
            partition = %services.partition.name(),
            member = %services.partition.local_member(),
            "service started"
        );
        Ok(Binding {
            services,
            dispatcher,
            listener,
        })
    }

    /// Withdraw from the replicant list and the partition.
    ///
    /// Order: remove this node's replicant, unregister the replicant listener,
    /// unregister the call handler. A no-op unless started.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.inner.state.write();
            match *state {
                ServiceState::Started => *state = ServiceState::Stopping,
                ServiceState::Destroyed | ServiceState::Starting | ServiceState::Stopping => {
                    return Err(self.invalid(*state, "stop"))
                }
                _ => return Ok(()),
            }
        }

        let binding = self.inner.binding.lock().take();
        if let Some(binding) = binding {
            self.unbind(binding).await;
        }
        self.set_state(ServiceState::Stopped);
        Ok(())
    }

    async fn unbind(&self, binding: Binding) {
        let key = &self.inner.key;
        let Binding {
            services,
            dispatcher,
            listener,
        } = binding;

        if let Err(err) = services.replicants.remove(key).await {
            tracing::warn!(service = %key, error = %err, "replicant removal failed");
        }
        services.replicants.unregister_listener(key, listener);
        services.partition.unregister_handler(key, &dispatcher);
        *self.inner.services.write() = None;
        tracing::info!(service = %key, partition = %services.partition.name(), "service stopped");
    }

    /// Stop if needed and refuse any further lifecycle operation.
    pub async fn destroy(&self) -> Result<()> {
        if self.state() == ServiceState::Started {
            self.stop().await?;
        }
        let mut state = self.inner.state.write();
        match *state {
            ServiceState::Destroyed => Ok(()),
            ServiceState::Starting | ServiceState::Stopping => Err(self.invalid(*state, "destroy")),
            _ => {
                *state = ServiceState::Destroyed;
                tracing::debug!(service = %self.inner.key, "service destroyed");
                Ok(())
            }
        }
    }

    /// Invoke `method` on every member's instance of this service, this node
    /// included, and wait for each reply or timeout.
    pub async fn call_method_on_partition(
        &self,
        method: &str,
        args: Payload,
    ) -> Result<ClusterResponses> {
        let services = self.bound("call")?;
        let call = ClusterCall::new(self.inner.key.clone(), method).with_args(args);
        Ok(services.partition.call_on_cluster(call).await?)
    }

    /// Invoke `method` on every other member's instance without waiting.
    ///
    /// Nothing is sent when the service is not bound or the partition cannot
    /// send; delivery failures are only logged.
    pub fn call_async_method_on_partition(&self, method: &str, args: Payload) {
        let Ok(services) = self.bound("call") else {
            tracing::debug!(service = %self.inner.key, method, "not bound, asynchronous call dropped");
            return;
        };
        let call = ClusterCall::new(self.inner.key.clone(), method)
            .with_args(args)
            .excluding_self();
        if let Err(err) = services.partition.cast_on_cluster(call) {
            tracing::debug!(service = %self.inner.key, method, error = %err, "asynchronous call not sent");
        }
    }

    /// Fan `event` out to this service's listeners on every member.
    ///
    /// The source is stamped with this service's key. Forwarding to the other
    /// members is best effort; local listeners always receive the event.
    pub fn send_notification(&self, mut event: NotificationEvent) {
        event.source = Some(self.inner.key.clone());

        match self.bound("notify") {
            Ok(services) => {
                let forwarded = ClusterCall::new(self.inner.key.clone(), RECEIVE_REMOTE_NOTIFICATION)
                    .with_encoded(&event)
                    .map_err(HaError::from)
                    .and_then(|call| {
                        services
                            .partition
                            .cast_on_cluster(call.excluding_self())
                            .map_err(HaError::from)
                    });
                if let Err(err) = forwarded {
                    tracing::warn!(
                        service = %self.inner.key,
                        event_type = %event.event_type,
                        error = %err,
                        "notification not forwarded"
                    );
                }
            }
            Err(_) => {
                tracing::debug!(service = %self.inner.key, "not bound, notification kept local");
            }
        }

        self.inner.notifications.deliver(&event);
    }

    /// Deliver an event received from another member to local listeners only.
    pub fn receive_remote_notification(&self, event: &NotificationEvent) {
        self.inner.notifications.deliver(event);
    }

    /// Next notification sequence number of this service instance.
    pub fn next_sequence(&self) -> u64 {
        self.inner.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Subscribe to notifications delivered on this node.
    pub fn add_notification_listener(
        &self,
        listener: Arc<dyn NotificationListener>,
    ) -> NotificationListenerId {
        self.inner.notifications.add(listener)
    }

    /// Unsubscribe. Returns whether the listener was registered.
    pub fn remove_notification_listener(&self, id: NotificationListenerId) -> bool {
        self.inner.notifications.remove(id)
    }

    /// Whether this node currently holds the master replica of the service.
    pub fn is_master_replica(&self) -> bool {
        self.bound("query")
            .is_ok_and(|services| services.replicants.is_master_replica(&self.inner.key))
    }

    /// Current replicant list of the service, empty when not bound.
    pub fn replicants(&self) -> ReplicantSnapshot {
        match self.bound("query") {
            Ok(services) => services.replicants.snapshot(&self.inner.key),
            Err(_) => ReplicantSnapshot::empty(self.inner.key.clone()),
        }
    }

    /// Distributed state of the bound partition.
    pub fn distributed_state(&self) -> Option<DistributedState> {
        self.bound("query").ok().map(|services| services.state)
    }

    /// Partition the service is bound to.
    pub fn partition(&self) -> Option<Arc<dyn Partition>> {
        self.bound("query").ok().map(|services| services.partition)
    }

    fn bound(&self, operation: &'static str) -> Result<PartitionServices> {
        self.inner
            .services
            .read()
            .clone()
            .ok_or_else(|| self.invalid(self.state(), operation))
    }

    fn set_state(&self, state: ServiceState) {
        *self.inner.state.write() = state;
        tracing::debug!(service = %self.inner.key, state = %state, "service state changed");
    }

    fn invalid(&self, state: ServiceState, operation: &'static str) -> HaError {
        HaError::invalid_state(self.inner.key.as_str(), state, operation)
    }
}

/// Partition handler for one service: routes forwarded notifications to the
/// local listeners and everything else to the concrete service.
struct Dispatcher<H> {
    service: Weak<ServiceInner<H>>,
}

#[async_trait]
impl<H: HaServiceHandler> ServiceHandler for Dispatcher<H> {
    async fn invoke(&self, invocation: Invocation) -> std::result::Result<Payload, CallError> {
        let Some(service) = self.service.upgrade() else {
            return Err(CallError::NoSuchService {
                service: invocation.service,
            });
        };
        if invocation.method == RECEIVE_REMOTE_NOTIFICATION {
            let event: NotificationEvent = invocation.args.decode()?;
            service.notifications.deliver(&event);
            return Ok(Payload::empty());
        }
        service.handler.invoke(invocation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::PartitionConfig;
    use cohort_partition::LocalFabric;
    use std::sync::OnceLock;

    struct Plain;

    impl HaServiceHandler for Plain {}

    async fn directory_on(fabric: &LocalFabric, node: &str) -> PartitionDirectory {
        let config = PartitionConfig::named(fabric.name());
        let partition = fabric.join(node, config.clone()).unwrap();
        let directory = PartitionDirectory::new();
        directory.register(PartitionServices::start(partition, &config).await.unwrap());
        directory
    }

    #[test]
    fn test_reserved_name_rejected() {
        assert!(HaService::create("__replicants", Plain, PartitionDirectory::new()).is_err());
        assert!(HaService::create("", Plain, PartitionDirectory::new()).is_err());
    }

    #[tokio::test]
    async fn test_unknown_partition_fails_start() {
        let service = HaService::create("svc", Plain, PartitionDirectory::new()).unwrap();
        let err = service.start().await.unwrap_err();
        assert_eq!(
            err,
            HaError::PartitionNotFound {
                name: DEFAULT_PARTITION_NAME.to_string()
            }
        );
        assert_eq!(service.state(), ServiceState::Failed);
    }

    #[tokio::test]
    async fn test_partition_name_locked_while_started() {
        let fabric = LocalFabric::new("Cluster");
        let service = HaService::create("svc", Plain, directory_on(&fabric, "a").await).unwrap();
        service.set_partition_name("Cluster").unwrap();
        service.start().await.unwrap();

        assert!(matches!(
            service.set_partition_name("Other"),
            Err(HaError::InvalidState {
                state: ServiceState::Started,
                ..
            })
        ));
        service.stop().await.unwrap();
        service.set_partition_name("Other").unwrap();
        assert_eq!(service.partition_name(), "Other");
    }

    #[tokio::test]
    async fn test_lifecycle_round_trip() {
        let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
        let service = HaService::create("svc", Plain, directory_on(&fabric, "a").await).unwrap();
        assert_eq!(service.state(), ServiceState::Created);

        service.start().await.unwrap();
        assert_eq!(service.state(), ServiceState::Started);
        assert!(service.is_master_replica());
        assert!(service.partition().is_some());

        service.stop().await.unwrap();
        assert_eq!(service.state(), ServiceState::Stopped);
        assert!(!service.is_master_replica());
        assert!(service.replicants().is_empty());
        assert!(service.distributed_state().is_none());

        service.start().await.unwrap();
        service.destroy().await.unwrap();
        assert_eq!(service.state(), ServiceState::Destroyed);
        assert!(service.start().await.is_err());
    }

    /// Records what the service reports about itself from inside each
    /// topology callback.
    #[derive(Default)]
    struct SelfAware {
        service: OnceLock<HaService<SelfAware>>,
        seen: Mutex<Vec<(bool, bool)>>,
    }

    impl HaServiceHandler for SelfAware {
        fn replicants_changed(&self, _snapshot: &ReplicantSnapshot) {
            if let Some(service) = self.service.get() {
                let observed = (service.is_master_replica(), service.partition().is_some());
                self.seen.lock().push(observed);
            }
        }
    }

    #[tokio::test]
    async fn test_callback_during_start_sees_bound_master() {
        let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
        let service =
            HaService::create("svc", SelfAware::default(), directory_on(&fabric, "a").await).unwrap();
        assert!(service.handler().service.set(service.clone()).is_ok());

        service.start().await.unwrap();
        assert_eq!(*service.handler().seen.lock(), vec![(true, true)]);

        service.stop().await.unwrap();
        assert_eq!(
            *service.handler().seen.lock(),
            vec![(true, true), (false, true)]
        );
        assert!(service.partition().is_none());
    }

    #[tokio::test]
    async fn test_default_handler_reports_missing_method() {
        let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
        let service = HaService::create("svc", Plain, directory_on(&fabric, "a").await).unwrap();
        service.start().await.unwrap();

        let responses = service
            .call_method_on_partition("anything", Payload::empty())
            .await
            .unwrap();
        let failures: Vec<_> = responses.failures().map(|(_, e)| e.clone()).collect();
        assert_eq!(
            failures,
            vec![CallError::no_such_method(&ServiceKey::new("svc"), "anything")]
        );
    }
}
