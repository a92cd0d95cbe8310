//! Cohort Core - Foundation Types
//!
//! Shared vocabulary for every crate in the cohort workspace:
//!
//! - Identifiers: `MemberId`, `JoinSeq`, `ViewId`, `ServiceKey`
//! - Membership: `Member`, `PartitionView`
//! - Opaque data: `Payload` with bincode-backed typed encoding
//! - Errors: `CohortError` and the crate-wide `Result` alias
//! - Configuration: `CohortConfig`, `PartitionConfig`, `ServiceConfig`
//!
//! # Architecture
//!
//! This crate has no async code and no knowledge of transports. Everything a
//! partition, replicant manager or HA service needs to agree on across nodes
//! lives here so that the higher crates only exchange these types.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod config;
pub mod errors;
pub mod identifiers;
pub mod payload;
pub mod view;

pub use config::{CohortConfig, PartitionConfig, ServiceConfig, DEFAULT_PARTITION_NAME};
pub use errors::{CohortError, Result};
pub use identifiers::{JoinSeq, MemberId, ServiceKey, ViewId};
pub use payload::Payload;
pub use view::{Member, PartitionView};
