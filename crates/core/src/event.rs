//! Domain event system: decoupled observation of engine activity.
//!
//! Events are published when a provider succeeds or fails, a breaker
//! changes state, a tool runs, or a run finishes. Subscribers (dashboards,
//! an outer routing layer) react without coupling to the engine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

/// All domain events in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A provider served a dispatch
    ProviderSucceeded {
        provider_id: String,
        tier: String,
        latency_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A provider call failed or timed out
    ProviderFailed {
        provider_id: String,
        tier: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A circuit breaker moved between states
    CircuitStateChanged {
        provider_id: String,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    },

    /// A tool was executed
    ToolExecuted {
        tool_name: String,
        success: bool,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A run returned to its caller
    RunFinished {
        conversation_id: String,
        status: String,
        steps: u32,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    /// Create a new event bus with the given capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
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

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::ToolExecuted {
            tool_name: "multiply".into(),
            success: true,
            duration_ms: 3,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::ToolExecuted { tool_name, success, .. } => {
                assert_eq!(tool_name, "multiply");
                assert!(success);
            }
            _ => panic!("Expected ToolExecuted event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::CircuitStateChanged {
            provider_id: "groq".into(),
            from: "closed".into(),
            to: "open".into(),
            timestamp: Utc::now(),
        });
    }
}
