//! Cohort Replicants - Distributed Replicant Manager
//!
//! Tracks, per service key, which members of a partition participate and in
//! what order. Each participating node contributes one opaque token; the list
//! is kept in partition join order and its first member holds the master
//! replica.
//!
//! - `ReplicantManager`: add/remove participation, listener registration,
//!   `is_master_replica` and lookups
//! - `ReplicantSnapshot`: a list together with the view id that produced it
//! - `ReplicantsListener`: push notification of list changes
//!
//! Push and pull stay separate: listeners learn that the list changed, and a
//! service asks `is_master_replica` when it needs to know whether to act.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod error;
pub mod manager;
mod slot;
pub mod types;

pub use error::{ReplicantError, Result};
pub use manager::{ReplicantManager, REPLICANTS_SERVICE};
pub use types::{ListenerId, ReplicantEntry, ReplicantSnapshot, ReplicantsListener};
