//! HA service errors

use crate::lifecycle::ServiceState;
use cohort_core::CohortError;
use cohort_partition::PartitionError;
use cohort_replicants::ReplicantError;
use cohort_state::StateError;
use thiserror::Error;

/// Errors from HA service operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HaError {
    /// The operation is not allowed in the service's current state.
    #[error("cannot {operation} service {service} while {state}")]
    InvalidState {
        /// Service name
        service: String,
        /// State the service was in
        state: ServiceState,
        /// Rejected operation
        operation: &'static str,
    },

    /// No partition of that name is known to the directory.
    #[error("partition not found: {name}")]
    PartitionNotFound {
        /// Requested partition name
        name: String,
    },

    /// Replicant manager failure
    #[error(transparent)]
    Replicants(#[from] ReplicantError),

    /// Distributed state failure
    #[error(transparent)]
    State(#[from] StateError),

    /// Partition failure
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// Foundation error (configuration, encoding)
    #[error(transparent)]
    Core(#[from] CohortError),
}

impl HaError {
    /// Create an invalid-state error.
    pub fn invalid_state(service: impl Into<String>, state: ServiceState, operation: &'static str) -> Self {
        Self::InvalidState {
            service: service.into(),
            state,
            operation,
        }
    }
}

/// Result type for HA service operations
pub type Result<T> = std::result::Result<T, HaError>;
