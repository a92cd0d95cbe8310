//! Service lifecycle states

use std::fmt;

/// Where an HA service is in its lifecycle.
///
/// ```text
/// Created -> Starting -> Started -> Stopping -> Stopped
///               |                                  |
///               v                                  v
///             Failed  ---- start ---->  Starting  <-
/// ```
///
/// Any state but `Destroyed` can move to `Destroyed`, after which nothing else
/// is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceState {
    /// Constructed, never started
    Created,
    /// Binding to the partition
    Starting,
    /// Registered with the partition and the replicant manager
    Started,
    /// Unbinding from the partition
    Stopping,
    /// Unbound; may be started again
    Stopped,
    /// The last start was rejected; may be started again
    Failed,
    /// Terminal
    Destroyed,
}

impl ServiceState {
    /// Whether `start` may begin from this state.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Created | Self::Stopped | Self::Failed)
    }

    /// Whether the partition binding may be changed in this state.
    pub fn can_rebind(self) -> bool {
        !matches!(self, Self::Starting | Self::Started | Self::Destroyed)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}
