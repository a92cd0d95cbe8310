//! Service handlers
//!
//! A handler is the callable a node binds to a service key. The partition
//! routes every incoming invocation for that key to it on a worker task.

use crate::error::CallError;
use async_trait::async_trait;
use cohort_core::{Member, Payload, ServiceKey};

/// An incoming method invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    /// Service key the call was addressed to
    pub service: ServiceKey,
    /// Method name
    pub method: String,
    /// Encoded arguments
    pub args: Payload,
    /// Member that issued the call
    pub caller: Member,
}

/// Callable bound to a service key on one node.
#[async_trait]
pub trait ServiceHandler: Send + Sync + 'static {
    /// Execute an invocation and produce the reply payload.
    async fn invoke(&self, invocation: Invocation) -> Result<Payload, CallError>;
}
