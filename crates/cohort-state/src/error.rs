//! Distributed state errors

use cohort_core::CohortError;
use cohort_partition::PartitionError;
use thiserror::Error;

/// Errors from distributed state operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateError {
    /// A stored value does not decode as the requested type.
    #[error("value of {service}/{key} does not decode: {message}")]
    Decode {
        /// Service scope
        service: String,
        /// Key within the service
        key: String,
        /// Decoder message
        message: String,
    },

    /// The partition rejected the operation.
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// Foundation error (encoding)
    #[error(transparent)]
    Core(#[from] CohortError),
}

/// Result type for distributed state operations
pub type Result<T> = std::result::Result<T, StateError>;
