//! Cohort Partition - Membership and Cluster Calls
//!
//! A partition is a group of cooperating nodes. This crate provides:
//!
//! - `Partition`: the contract every higher layer programs against (views,
//!   handler registration, synchronous and fire-and-forget broadcasts,
//!   targeted calls)
//! - `ClusterCall` / `ClusterResponses`: request builder and per-member results
//! - `ServiceHandler`: the callable a node binds to a service key
//! - `LocalFabric` / `LocalPartition`: in-process implementation acting as the
//!   single membership authority, with per-node worker pools, per-member
//!   timeouts and fault injection
//!
//! # Delivery guarantees
//!
//! A broadcast reaches each member of the caller's current view at most once.
//! Replies from different members are collected concurrently; a member that
//! times out or leaves mid-call is reported as a per-member failure and never
//! fails the call as a whole. Nothing orders two different calls relative to
//! each other at different members.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod call;
pub mod error;
pub mod handler;
pub mod local;
pub mod partition;

pub use call::{ClusterCall, ClusterResponses, MemberResponse};
pub use error::{CallError, PartitionError, Result};
pub use handler::{Invocation, ServiceHandler};
pub use local::{FaultMode, LocalFabric, LocalPartition};
pub use partition::Partition;
