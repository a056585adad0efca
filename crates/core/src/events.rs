//! Session notifications for subscribers (UI bindings, WebSocket clients).

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::CollectStep;
use crate::payment::PaymentIntent;
use crate::reader::Reader;
use crate::registry::DiscoveryStatus;
use crate::session::SessionState;

/// Event published by a terminal session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// The session moved between states.
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// A discovery scan finished.
    ReadersDiscovered {
        count: usize,
        diagnostic: DiscoveryStatus,
    },
    ReaderConnected { reader: Reader },
    /// The reader was released. `expected` is false when the hardware dropped it.
    ReaderDisconnected { reader_id: String, expected: bool },
    /// A collection step is about to run.
    CollectStepStarted {
        step: CollectStep,
        intent_id: Option<String>,
    },
    /// The cached copy of a payment intent changed.
    PaymentIntentUpdated { intent: PaymentIntent },
    /// Prompt from the reader for the cardholder.
    ReaderDisplayMessage { message: String },
}

impl SessionEvent {
    /// Short label, used for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            SessionEvent::StateChanged { .. } => "state_changed",
            SessionEvent::ReadersDiscovered { .. } => "readers_discovered",
            SessionEvent::ReaderConnected { .. } => "reader_connected",
            SessionEvent::ReaderDisconnected { .. } => "reader_disconnected",
            SessionEvent::CollectStepStarted { .. } => "collect_step_started",
            SessionEvent::PaymentIntentUpdated { .. } => "payment_intent_updated",
            SessionEvent::ReaderDisplayMessage { .. } => "reader_display_message",
        }
    }
}

/// Broadcast channel for session events.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    /// Create a new bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn state_changed(&self, from: SessionState, to: SessionState) {
        if from != to {
            self.publish(SessionEvent::StateChanged { from, to });
        }
    }

    pub fn intent_updated(&self, intent: &PaymentIntent) {
        self.publish(SessionEvent::PaymentIntentUpdated {
            intent: intent.clone(),
        });
    }

    pub fn reader_disconnected(&self, reader_id: &str, expected: bool) {
        self.publish(SessionEvent::ReaderDisconnected {
            reader_id: reader_id.to_string(),
            expected,
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.state_changed(SessionState::Ready, SessionState::Connecting);
        assert_eq!(
            rx.recv().await.unwrap(),
            SessionEvent::StateChanged {
                from: SessionState::Ready,
                to: SessionState::Connecting
            }
        );
    }

    #[tokio::test]
    async fn test_same_state_not_published() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();

        bus.state_changed(SessionState::Ready, SessionState::Ready);
        bus.reader_disconnected("tmr_1", false);

        assert_eq!(rx.recv().await.unwrap().label(), "reader_disconnected");
    }

    #[test]
    fn test_publish_without_subscribers() {
        EventBus::default().reader_disconnected("tmr_1", true);
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(SessionEvent::CollectStepStarted {
            step: CollectStep::CollectPaymentMethod,
            intent_id: Some("pi_1".into()),
        })
        .unwrap();
        assert_eq!(json["type"], "collect_step_started");
        assert_eq!(json["step"], "collect_payment_method");
    }
}
