//! Domain event system: decoupled notifications from the execution core.
//!
//! The scheduler, loop detector and compressor publish events here; UI and
//! logging collaborators subscribe. An [`EventBus`] is an explicit instance
//! handed to each component, never a process-wide singleton.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::tool::ToolCallStatus;

/// Which kind of unproductive pattern was detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoopKind {
    /// The same tool with the same arguments, over and over.
    ConsecutiveIdenticalToolCalls,
    /// A monitored tool called back to back regardless of arguments.
    RepeatedToolName,
    /// The same text repeated in the streamed answer.
    ChantingIdenticalSentences,
    /// The model judged the conversation to be stuck.
    LlmDetectedLoop,
}

impl LoopKind {
    /// A short message suitable for showing to the user.
    pub fn describe(self) -> &'static str {
        match self {
            Self::ConsecutiveIdenticalToolCalls => {
                "the same tool call was repeated with identical arguments"
            }
            Self::RepeatedToolName => "the same tool was called repeatedly without progress",
            Self::ChantingIdenticalSentences => "the response kept repeating the same text",
            Self::LlmDetectedLoop => "the conversation appears stuck without making progress",
        }
    }
}

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A tool call moved to a new state.
    ToolCallStatusChanged {
        call_id: String,
        tool_name: String,
        status: ToolCallStatus,
        timestamp: DateTime<Utc>,
    },

    /// A running tool produced partial output.
    ToolOutputChunk { call_id: String, chunk: String },

    /// Every call of a batch reached a terminal state.
    ToolBatchCompleted {
        batch_size: usize,
        succeeded: usize,
        failed: usize,
        cancelled: usize,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// A loop was detected for the current prompt.
    LoopDetected {
        kind: LoopKind,
        prompt_id: String,
        timestamp: DateTime<Utc>,
    },

    /// History was replaced by a compressed version.
    ChatCompressed {
        original_tokens: u64,
        new_tokens: u64,
        timestamp: DateTime<Utc>,
    },

    /// Reconciliation repaired the history before a request.
    HistoryReconciled {
        synthesized: usize,
        dropped: usize,
        timestamp: DateTime<Utc>,
    },

    /// A degraded-mode failure worth surfacing.
    ErrorOccurred {
        context: String,
        error_message: String,
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
        // No subscribers is fine.
        let _ = self.sender.send(Arc::new(event));
    }

    /// Subscribe to receive events.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn event_bus_publish_subscribe() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.publish(DomainEvent::ToolCallStatusChanged {
            call_id: "c1".into(),
            tool_name: "shell".into(),
            status: ToolCallStatus::Executing,
            timestamp: Utc::now(),
        });

        let event = rx.recv().await.unwrap();
        match event.as_ref() {
            DomainEvent::ToolCallStatusChanged { tool_name, status, .. } => {
                assert_eq!(tool_name, "shell");
                assert_eq!(*status, ToolCallStatus::Executing);
            }
            _ => panic!("Expected ToolCallStatusChanged event"),
        }
    }

    #[test]
    fn event_bus_no_subscribers_doesnt_panic() {
        let bus = EventBus::new(16);
        bus.publish(DomainEvent::ErrorOccurred {
            context: "test".into(),
            error_message: "no subscribers".into(),
            timestamp: Utc::now(),
        });
    }

    #[test]
    fn loop_kind_wire_names() {
        let json = serde_json::to_string(&LoopKind::ConsecutiveIdenticalToolCalls).unwrap();
        assert_eq!(json, r#""CONSECUTIVE_IDENTICAL_TOOL_CALLS""#);
        assert!(!LoopKind::LlmDetectedLoop.describe().is_empty());
    }
}
