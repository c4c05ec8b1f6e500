pub mod git_repo_builder;

#[allow(unused_imports)]
pub use git_repo_builder::{GitRepoBuilder, TestRepo};

use std::time::Duration;

use agent_session_engine::{EventBus, EventEnvelope};
use tokio::sync::broadcast::Receiver;

/// Collect every event published within `window`.
#[allow(dead_code)]
pub async fn drain_events(rx: &mut Receiver<EventEnvelope>, window: Duration) -> Vec<EventEnvelope> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Ok(event)) => events.push(event),
            Ok(Err(_)) | Err(_) => break,
        }
    }
    events
}

/// Subscribe to a bus before an action, for later draining.
#[allow(dead_code)]
pub fn subscribe(bus: &EventBus) -> Receiver<EventEnvelope> {
    bus.subscribe()
}
