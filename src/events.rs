//! Event bus for audit and lifecycle events
//!
//! Components publish typed events by value and subscribers hold broadcast
//! receivers; nothing holds references to other components through the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use crate::registry::ModelStatus;

/// Phases of a single adapter dispatch
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPhase {
    Preparing,
    Dialing,
    Streaming,
    Draining,
    Done,
    Errored,
    Cancelled,
}

/// Events published on the router bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouterEvent {
    ModelRegistered {
        model_id: String,
        provider: String,
    },
    ModelUnregistered {
        model_id: String,
    },
    DispatchPhaseChanged {
        request_id: Uuid,
        model_id: String,
        phase: DispatchPhase,
    },
    DispatchFinished {
        request_id: Uuid,
        model_id: String,
        latency_ms: u64,
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    DispatchFailed {
        request_id: Uuid,
        model_id: String,
        kind: String,
        attempt: u32,
    },
    CacheHit {
        request_id: Uuid,
        semantic: bool,
        similarity: Option<f32>,
    },
    RateLimited {
        key_id: String,
        retry_after_ms: u64,
    },
    HealthChanged {
        model_id: String,
        status: ModelStatus,
    },
    CostRecorded {
        request_id: Uuid,
        model_id: String,
        input_cost: f64,
        output_cost: f64,
    },
}

/// A bus event stamped with emission time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    pub event: RouterEvent,
    pub timestamp: DateTime<Utc>,
}

/// Broadcast-backed event bus
pub struct EventBus {
    sender: broadcast::Sender<AuditRecord>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender }
    }

    /// Publish an event to all subscribers; lagging receivers drop history
    pub fn publish(&self, event: RouterEvent) {
        debug!("Event published: {:?}", event);
        let record = AuditRecord {
            id: Uuid::new_v4(),
            event,
            timestamp: Utc::now(),
        };
        let _ = self.sender.send(record);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuditRecord> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.publish(RouterEvent::ModelRegistered {
            model_id: "openai:gpt-4o".into(),
            provider: "openai".into(),
        });

        let record = rx.recv().await.unwrap();
        match record.event {
            RouterEvent::ModelRegistered { model_id, .. } => {
                assert_eq!(model_id, "openai:gpt-4o")
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        bus.publish(RouterEvent::ModelUnregistered {
            model_id: "gone".into(),
        });
    }
}
