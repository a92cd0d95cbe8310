//! Opaque payloads
//!
//! Everything that crosses the partition boundary (call arguments, replies,
//! replicant tokens, state values, notification bodies) travels as a `Payload`.
//! The layer imposes no format; `encode`/`decode` are convenience helpers
//! backed by bincode.

use crate::errors::{CohortError, Result};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Immutable, cheaply cloneable byte buffer.
#[derive(Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    /// Empty payload (e.g. a replicant token carrying no data).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap raw bytes.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(Arc::from(bytes.into()))
    }

    /// Encode a serializable value.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let bytes = bincode::serialize(value)
            .map_err(|e| CohortError::serialization(format!("encode failed: {e}")))?;
        Ok(Self::from_bytes(bytes))
    }

    /// Decode into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.0)
            .map_err(|e| CohortError::serialization(format!("decode failed: {e}")))
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the payload carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Self(Arc::from(bytes))
    }
}
