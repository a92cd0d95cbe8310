//! Versioned state entries
//!
//! Every write carries a `StateVersion`: a Lamport clock plus the writer's
//! member id. Versions are totally ordered by `(clock, writer)`, so any two
//! nodes that have seen the same writes agree on the winner regardless of the
//! order the writes arrived in. Removal writes a tombstone (`value == None`)
//! with its own version, so an older write that arrives late stays dead.

use cohort_core::{MemberId, Payload, ServiceKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Version of one write.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StateVersion {
    /// Lamport clock of the writer at the time of the write
    pub clock: u64,
    /// Tie-break between writes with equal clocks
    pub writer: MemberId,
}

impl StateVersion {
    /// Create a version.
    pub fn new(clock: u64, writer: MemberId) -> Self {
        Self { clock, writer }
    }
}

impl fmt::Display for StateVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.writer)
    }
}

/// One replicated write, as exchanged between members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEntry {
    /// Service scope
    pub service: ServiceKey,
    /// Key within the service
    pub key: String,
    /// New value, or `None` for a removal
    pub value: Option<Payload>,
    /// Version of the write
    pub version: StateVersion,
}

impl StateEntry {
    /// Whether this write is a removal.
    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Winning write stored for one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Versioned {
    pub(crate) value: Option<Payload>,
    pub(crate) version: StateVersion,
}

impl Versioned {
    /// Replace `current` with `incoming` if the incoming write is newer.
    pub(crate) fn merge(current: &mut Option<Versioned>, incoming: Versioned) -> bool {
        match current {
            Some(existing) if existing.version >= incoming.version => false,
            _ => {
                *current = Some(incoming);
                true
            }
        }
    }
}
