//! In-process restart event publication.
//!
//! Events are advisory: emission never blocks orchestration and slow or
//! absent subscribers are dropped by the broadcast channel.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::orchestrator::RestartPhase;

/// Ordered events published by the orchestrator during a run.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RestartEvent {
    Started {
        total_nodes: u64,
        started_at: DateTime<Utc>,
    },
    PhaseChange {
        phase: RestartPhase,
        node: Option<String>,
    },
    Progress {
        completed: u64,
        total: u64,
        node: String,
    },
    Completed {
        completed_at: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
    Cancelled {
        node: Option<String>,
    },
}

/// Broadcast-backed publisher for [`RestartEvent`].
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RestartEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event; a missing subscriber is not an error.
    pub fn emit(&self, event: RestartEvent) {
        debug!(event = ?event, "Publishing restart event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RestartEvent> {
        self.sender.subscribe()
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
    async fn test_emit_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.emit(RestartEvent::Failed {
            error: "nobody listening".to_string(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(RestartEvent::Started {
            total_nodes: 3,
            started_at: Utc::now(),
        });
        bus.emit(RestartEvent::PhaseChange {
            phase: RestartPhase::Preparing,
            node: Some("a".to_string()),
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            RestartEvent::Started { total_nodes: 3, .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            RestartEvent::PhaseChange { .. }
        ));
    }
}
