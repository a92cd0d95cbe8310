//! Notification events and local listener set

use cohort_core::{Payload, ServiceKey};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Reserved method through which siblings forward notifications.
pub const RECEIVE_REMOTE_NOTIFICATION: &str = "receiveRemoteNotification";

/// An event fanned out to every member's listeners of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationEvent {
    /// Service that sent the event; stamped on send
    pub source: Option<ServiceKey>,
    /// Application-defined event type
    pub event_type: String,
    /// Sender-assigned sequence number
    pub sequence: u64,
    /// Event body
    pub payload: Payload,
}

impl NotificationEvent {
    /// Unsent event without a source.
    pub fn new(event_type: impl Into<String>, sequence: u64, payload: Payload) -> Self {
        Self {
            source: None,
            event_type: event_type.into(),
            sequence,
            payload,
        }
    }
}

/// Receives notifications on the local node.
pub trait NotificationListener: Send + Sync + 'static {
    /// Handle one event.
    fn handle_notification(&self, event: &NotificationEvent);
}

impl<F> NotificationListener for F
where
    F: Fn(&NotificationEvent) + Send + Sync + 'static,
{
    fn handle_notification(&self, event: &NotificationEvent) {
        self(event);
    }
}

/// Handle returned by listener registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationListenerId(u64);

/// Local listeners of one service.
#[derive(Default)]
pub(crate) struct NotificationListeners {
    next: AtomicU64,
    listeners: RwLock<Vec<(NotificationListenerId, Arc<dyn NotificationListener>)>>,
}

impl NotificationListeners {
    pub(crate) fn add(&self, listener: Arc<dyn NotificationListener>) -> NotificationListenerId {
        let id = NotificationListenerId(self.next.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    pub(crate) fn remove(&self, id: NotificationListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    /// Deliver to every listener registered at the time of the call.
    pub(crate) fn deliver(&self, event: &NotificationEvent) {
        let listeners = self.listeners.read().clone();
        for (_, listener) in listeners {
            listener.handle_notification(event);
        }
    }
}
