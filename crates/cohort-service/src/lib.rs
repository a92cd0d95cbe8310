//! Cohort Service - High-Availability Service Façade
//!
//! The layer a concrete clustered service plugs into:
//!
//! - `HaService`: lifecycle (`create`/`start`/`stop`/`destroy`) bound to
//!   partition handler registration and replicant participation, cluster-wide
//!   method calls, and notification fan-out
//! - `HaServiceHandler`: what the concrete service implements
//! - `PartitionDirectory` / `PartitionServices`: explicit, per-process name
//!   resolution of partitions and the replicant manager and distributed state
//!   running on them
//! - `NotificationEvent` / `NotificationListener`: events delivered locally
//!   without condition and forwarded to other members on a best-effort basis
//!
//! # Example
//!
//! ```rust,no_run
//! use cohort_core::{PartitionConfig, DEFAULT_PARTITION_NAME};
//! use cohort_partition::LocalFabric;
//! use cohort_service::{HaService, HaServiceHandler, PartitionDirectory, PartitionServices};
//!
//! struct Scheduler;
//! impl HaServiceHandler for Scheduler {}
//!
//! # async fn example() -> cohort_service::Result<()> {
//! let fabric = LocalFabric::new(DEFAULT_PARTITION_NAME);
//! let config = PartitionConfig::default();
//! let partition = fabric.join("node-1", config.clone())?;
//!
//! let directory = PartitionDirectory::new();
//! directory.register(PartitionServices::start(partition, &config).await?);
//!
//! let service = HaService::create("scheduler", Scheduler, directory)?;
//! service.start().await?;
//! if service.is_master_replica() {
//!     // run the singleton work
//! }
//! service.stop().await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod directory;
pub mod error;
pub mod lifecycle;
pub mod notification;
pub mod service;

pub use directory::{PartitionDirectory, PartitionServices};
pub use error::{HaError, Result};
pub use lifecycle::ServiceState;
pub use notification::{
    NotificationEvent, NotificationListener, NotificationListenerId, RECEIVE_REMOTE_NOTIFICATION,
};
pub use service::{HaService, HaServiceHandler};

pub use cohort_partition::Invocation;
pub use cohort_replicants::ReplicantSnapshot;
