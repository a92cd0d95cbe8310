//! Cluster call requests and per-member responses

use crate::error::{CallError, PartitionError, Result};
use cohort_core::{Member, Payload, ServiceKey};
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;

/// A method invocation addressed to a service on one or more members.
#[derive(Debug, Clone)]
pub struct ClusterCall {
    /// Handler key on the target members
    pub service: ServiceKey,
    /// Method name understood by the handler
    pub method: String,
    /// Encoded arguments
    pub args: Payload,
    /// Skip the calling node when broadcasting
    pub exclude_self: bool,
    /// Per-member timeout; the partition default applies when unset
    pub timeout: Option<Duration>,
}

impl ClusterCall {
    /// Call with empty arguments.
    pub fn new(service: impl Into<ServiceKey>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            args: Payload::empty(),
            exclude_self: false,
            timeout: None,
        }
    }

    /// Set raw arguments.
    pub fn with_args(mut self, args: Payload) -> Self {
        self.args = args;
        self
    }

    /// Encode typed arguments.
    pub fn with_encoded<T: Serialize + ?Sized>(mut self, args: &T) -> Result<Self> {
        self.args = Payload::encode(args)?;
        Ok(self)
    }

    /// Broadcast to every member except the caller.
    pub fn excluding_self(mut self) -> Self {
        self.exclude_self = true;
        self
    }

    /// Override the per-member timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One member's outcome of a cluster call.
#[derive(Debug, Clone)]
pub struct MemberResponse {
    /// Member the call was delivered to
    pub member: Member,
    /// Reply or per-member failure
    pub outcome: std::result::Result<Payload, CallError>,
}

impl MemberResponse {
    /// Whether the member replied successfully.
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Collected responses of a synchronous broadcast, in view order.
#[derive(Debug, Clone, Default)]
pub struct ClusterResponses {
    responses: Vec<MemberResponse>,
}

impl ClusterResponses {
    pub(crate) fn new(responses: Vec<MemberResponse>) -> Self {
        Self { responses }
    }

    /// All responses.
    pub fn responses(&self) -> &[MemberResponse] {
        &self.responses
    }

    /// Number of members that were targeted.
    pub fn len(&self) -> usize {
        self.responses.len()
    }

    /// Whether no member was targeted.
    pub fn is_empty(&self) -> bool {
        self.responses.is_empty()
    }

    /// Successful replies with their members.
    pub fn successes(&self) -> impl Iterator<Item = (&Member, &Payload)> {
        self.responses
            .iter()
            .filter_map(|r| r.outcome.as_ref().ok().map(|p| (&r.member, p)))
    }

    /// Failures with their members.
    pub fn failures(&self) -> impl Iterator<Item = (&Member, &CallError)> {
        self.responses
            .iter()
            .filter_map(|r| r.outcome.as_ref().err().map(|e| (&r.member, e)))
    }

    /// Whether every targeted member replied.
    pub fn all_succeeded(&self) -> bool {
        self.responses.iter().all(MemberResponse::is_success)
    }

    /// Every reply, or an error listing the members that failed.
    pub fn into_payloads(self) -> Result<Vec<Payload>> {
        let failures: Vec<_> = self
            .failures()
            .map(|(member, err)| (member.id, err.clone()))
            .collect();
        if !failures.is_empty() {
            return Err(PartitionError::RemoteFailures { failures });
        }
        Ok(self
            .responses
            .into_iter()
            .filter_map(|r| r.outcome.ok())
            .collect())
    }

    /// Decode every successful reply, skipping failed members.
    pub fn decode_successes<T: DeserializeOwned>(&self) -> Result<Vec<(Member, T)>> {
        self.successes()
            .map(|(member, payload)| Ok((member.clone(), payload.decode::<T>()?)))
            .collect()
    }
}
