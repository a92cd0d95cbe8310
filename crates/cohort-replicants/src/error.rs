//! Replicant manager errors

use cohort_core::CohortError;
use cohort_partition::PartitionError;
use thiserror::Error;

/// Errors from replicant manager operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicantError {
    /// Operation requires `start()` to have completed.
    #[error("replicant manager for partition {partition} is not started")]
    NotStarted {
        /// Partition name
        partition: String,
    },

    /// The partition rejected the operation.
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// Foundation error (encoding)
    #[error(transparent)]
    Core(#[from] CohortError),
}

/// Result type for replicant manager operations
pub type Result<T> = std::result::Result<T, ReplicantError>;
