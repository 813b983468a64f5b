//! UI broadcast (T3, spec.md §6): every connected UI channel subscriber
//! receives the same stream of state-change events over a `broadcast`
//! channel, plus a synthesized `init` snapshot on first subscribe.

use crate::model::{Conversation, Flow, PendingRefusal};
use serde::Serialize;
use tokio::sync::broadcast;

/// Bounded so a slow or disconnected UI subscriber can't grow this
/// unboundedly; lagged subscribers just miss events and re-sync via their
/// next `init` (spec.md §6 "the UI channel is best-effort fan-out").
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UiEvent {
    Traffic { flow: Flow },
    TrafficDeleted { flow_id: String },
    TrafficCleared,
    Conversation { conversation: Conversation },
    StreamUpdate { flow_id: String, partial: serde_json::Value },
    Intercept { flow_id: String, intercept_type: crate::model::InterceptType },
    InterceptCompleted { flow_id: String },
    InterceptDropped { flow_id: String },
    InterceptModeChanged { mode: crate::intercept::InterceptMode },
    RulesEnabledChanged { enabled: bool },
    PendingRefusal { refusal: PendingRefusal },
    RefusalResolved { id: String, status: crate::model::RefusalStatus },
    RefusalDetected { flow_id: String, score: f32, rule_id: String },
    AlternateGenerated { flow_id: String, body: String },
}

/// Thin wrapper around a `broadcast::Sender` so callers don't need to know
/// the channel capacity or handle `send`'s `Result` (a send with no
/// subscribers is not an error here).
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UiEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UiEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: UiEvent) {
        // No subscribers is the common case between UI connections; the
        // send error there is not worth logging.
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_with_no_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(UiEvent::TrafficCleared);
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(UiEvent::InterceptModeChanged { mode: crate::intercept::InterceptMode::Passthrough });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, UiEvent::InterceptModeChanged { mode: crate::intercept::InterceptMode::Passthrough }));
    }

    #[tokio::test]
    async fn lagging_subscriber_does_not_block_publisher() {
        let bus = EventBus::new();
        let _rx = bus.subscribe();
        for _ in 0..(CHANNEL_CAPACITY + 10) {
            bus.publish(UiEvent::TrafficCleared);
        }
    }
}
