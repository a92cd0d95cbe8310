//! Unified error type for cohort foundations
//!
//! Higher crates define their own error enums and convert from `CohortError`
//! where a foundation operation (encoding, configuration) fails underneath
//! them.

use serde::{Deserialize, Serialize};

/// Foundation-level error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum CohortError {
    /// Invalid input
    #[error("Invalid: {message}")]
    Invalid {
        /// Error message describing the invalid input
        message: String,
    },

    /// Configuration could not be loaded or failed validation
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message describing the configuration problem
        message: String,
    },

    /// Resource not found
    #[error("Not found: {message}")]
    NotFound {
        /// Error message describing what was not found
        message: String,
    },

    /// Serialization/deserialization error
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message describing the serialization failure
        message: String,
    },

    /// Internal system error
    #[error("Internal error: {message}")]
    Internal {
        /// Error message describing the internal error
        message: String,
    },
}

impl CohortError {
    /// Create an invalid input error
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Standard Result type for foundation operations
pub type Result<T> = std::result::Result<T, CohortError>;

impl From<std::io::Error> for CohortError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(err.to_string()),
            _ => Self::internal(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for CohortError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration(err.to_string())
    }
}
