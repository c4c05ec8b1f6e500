//! Typed publish/subscribe event bus.
//!
//! Every component reports outward through this bus; consumers (dashboard,
//! logs) subscribe to the broadcast stream. The bus holds no domain state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Well-known event channels, namespaced `domain:action`.
pub mod channels {
    pub const SESSION_REPORTED: &str = "session:reported";
    pub const SESSION_UPDATED: &str = "session:updated";
    pub const SESSION_CLOSED: &str = "session:closed";
    pub const AGENT_REGISTERED: &str = "agent:registered";
    pub const AGENT_HEARTBEAT: &str = "agent:heartbeat";
    pub const INSTANCE_DELETED: &str = "instance:deleted";
    pub const WATCHER_FILE_CHANGED: &str = "watcher:file-changed";
    pub const COMMIT_TRIGGERED: &str = "commit:triggered";
    pub const COMMIT_COMPLETED: &str = "commit:completed";
    pub const COMMIT_PUSH_FAILED: &str = "commit:push-failed";
    pub const LOCK_CHANGED: &str = "lock:changed";
    pub const REBASE_COMPLETED: &str = "rebase-watcher:completed";
    pub const RECOVERY_ORPHANS_FOUND: &str = "recovery:orphans-found";
    pub const RECENT_REPOS_CHANGED: &str = "recent-repos:changed";
    pub const WORKSPACE_REMOTE_REBIND_FAILED: &str = "workspace:remote-rebind-failed";
}

/// One published event.
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub channel: String,
    pub payload: Value,
    pub occurred_at: String,
}

/// Broadcast event bus shared by every engine component.
///
/// Cloning is cheap; all clones publish into the same stream. `shutdown`
/// stops further publishes so events cannot fire after engine teardown.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    open: Arc<AtomicBool>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Publish an event. Lagging or absent subscribers are not an error.
    pub fn publish(&self, channel: &str, payload: Value) {
        if !self.open.load(Ordering::Acquire) {
            return;
        }
        let envelope = EventEnvelope {
            channel: channel.to_string(),
            payload,
            occurred_at: Utc::now().to_rfc3339(),
        };
        if self.tx.send(envelope).is_err() {
            tracing::trace!(channel, "event published with no subscribers");
        }
    }

    /// Stop accepting publishes. Subscribers drain what was already sent.
    pub fn shutdown(&self) {
        self.open.store(false, Ordering::Release);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(channels::SESSION_REPORTED, json!({"sessionId": "sess-1"}));

        let event = rx.recv().await.expect("event");
        assert_eq!(event.channel, channels::SESSION_REPORTED);
        assert_eq!(event.payload["sessionId"], "sess-1");
        assert!(!event.occurred_at.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_publishes() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.shutdown();
        bus.publish(channels::SESSION_CLOSED, json!({}));

        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new(8);
        // No receiver; must not panic or error.
        bus.publish(channels::LOCK_CHANGED, json!({"paths": []}));
    }
}
