//! Partition error types
//!
//! Two levels: `CallError` describes what happened at one member during a
//! cluster call and is reported per member; `PartitionError` is what a
//! partition operation returns to its caller.

use cohort_core::{CohortError, MemberId, ServiceKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Outcome of a failed invocation on a single member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum CallError {
    /// No handler is registered for the service on the target member.
    #[error("no such service: {service}")]
    NoSuchService {
        /// Service the call was addressed to
        service: ServiceKey,
    },

    /// The handler exists but does not expose the method.
    #[error("service {service} has no method {method}")]
    NoSuchMethod {
        /// Service the call was addressed to
        service: ServiceKey,
        /// Requested method
        method: String,
    },

    /// The member did not reply within the per-member timeout.
    #[error("no reply within {after_ms} ms")]
    Timeout {
        /// Timeout that elapsed
        after_ms: u64,
    },

    /// The member left the partition before replying.
    #[error("member left the partition")]
    MemberLeft,

    /// The handler ran and reported a failure.
    #[error("handler failed: {message}")]
    Handler {
        /// Failure reported by the remote handler
        message: String,
    },
}

impl CallError {
    /// Create a no-such-method error.
    pub fn no_such_method(service: &ServiceKey, method: impl Into<String>) -> Self {
        Self::NoSuchMethod {
            service: service.clone(),
            method: method.into(),
        }
    }

    /// Create a handler failure.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
        }
    }
}

impl From<CohortError> for CallError {
    fn from(err: CohortError) -> Self {
        Self::handler(err.to_string())
    }
}

/// Errors returned by partition operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PartitionError {
    /// The local node is not currently a member of the partition.
    #[error("partition {partition} is disconnected")]
    Disconnected {
        /// Partition name
        partition: String,
    },

    /// The transport refused to send anything.
    #[error("partition {partition} transport unavailable")]
    Unavailable {
        /// Partition name
        partition: String,
    },

    /// A targeted call named a member that is not in the current view.
    #[error("{member} is not a member of the current view")]
    NotMember {
        /// Requested member
        member: MemberId,
    },

    /// A targeted call failed at the member.
    #[error("call to {member} failed: {source}")]
    Call {
        /// Target member
        member: MemberId,
        /// Per-member failure
        source: CallError,
    },

    /// One or more members failed a broadcast that required every reply.
    #[error("{} member(s) failed the call", .failures.len())]
    RemoteFailures {
        /// Failed members and their errors
        failures: Vec<(MemberId, CallError)>,
    },

    /// Foundation error (encoding, configuration)
    #[error(transparent)]
    Core(#[from] CohortError),
}

impl PartitionError {
    /// Create a disconnected error.
    pub fn disconnected(partition: impl Into<String>) -> Self {
        Self::Disconnected {
            partition: partition.into(),
        }
    }

    /// Create an unavailable error.
    pub fn unavailable(partition: impl Into<String>) -> Self {
        Self::Unavailable {
            partition: partition.into(),
        }
    }
}

/// Result type for partition operations
pub type Result<T> = std::result::Result<T, PartitionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CallError::NoSuchService {
            service: ServiceKey::new("scheduler"),
        };
        assert_eq!(err.to_string(), "no such service: scheduler");

        let err = PartitionError::RemoteFailures {
            failures: vec![(MemberId::from_u128(1), CallError::Timeout { after_ms: 50 })],
        };
        assert!(err.to_string().contains("1 member(s)"));
    }
}
