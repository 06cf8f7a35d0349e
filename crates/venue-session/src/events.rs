//! Session-ended notification
//!
//! The one event the rest of the dashboard consumes from the client core.
//! Routing subscribes at startup, drops in-memory user state and navigates to
//! the login screen when it fires.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::classify::LogoutReason;

/// Default channel capacity. Events are rare (at most one per failed refresh).
const DEFAULT_CHANNEL_CAPACITY: usize = 16;

/// Payload of the session-ended broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionEnded {
    pub reason: LogoutReason,
    pub backend_error: Option<String>,
}

impl SessionEnded {
    /// Name of the broadcast, for hosts that route events by name.
    pub const NAME: &'static str = "session:ended";
}

/// Broadcaster for [`SessionEnded`] events.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct SessionEvents {
    sender: broadcast::Sender<SessionEnded>,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEnded> {
        self.sender.subscribe()
    }

    /// Publish a session-ended event. Never blocks.
    ///
    /// Returns the number of subscribers that received it (0 if none).
    pub fn publish(&self, reason: LogoutReason, backend_error: Option<String>) -> usize {
        info!(
            event = SessionEnded::NAME,
            reason = reason.as_str(),
            backend_error = backend_error.as_deref(),
            "session ended"
        );
        let delivered = self
            .sender
            .send(SessionEnded {
                reason,
                backend_error,
            })
            .unwrap_or(0);
        debug!(delivered, "session event published");
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SessionEvents {
    fn default() -> Self {
        Self::new()
    }
}
