//! Cohort State - Distributed Key/Value State
//!
//! Small pieces of shared state scoped by `(service, key)`. Reads are local;
//! writes are applied locally before returning and reach the other members
//! asynchronously. Conflicting writes resolve last-writer-wins on
//! `StateVersion` (Lamport clock, then writer id), and removals leave
//! versioned tombstones.

#![deny(missing_docs)]
#![forbid(unsafe_code)]

pub mod entry;
pub mod error;
pub mod state;

pub use entry::{StateEntry, StateVersion};
pub use error::{Result, StateError};
pub use state::{DistributedState, StateListener, StateListenerId, STATE_SERVICE};
