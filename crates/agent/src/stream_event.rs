//! Turn-level streaming events.
//!
//! `TurnEvent` wraps model stream chunks and scheduler results into
//! higher-level events that a front end can render or forward as JSON.

use serde::{Deserialize, Serialize};
use turnwright_core::event::LoopKind;
use turnwright_core::model::Usage;
use turnwright_core::tool::ToolCallStatus;

/// Why a turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum TurnStop {
    /// The model answered without requesting tools.
    Completed,
    /// A loop was detected and the turn was halted.
    LoopDetected { kind: LoopKind },
    /// The iteration limit was reached.
    MaxIterations,
    /// The user cancelled.
    Cancelled,
}

/// Events emitted while a turn runs.
///
/// - `chunk`: partial text from the model
/// - `tool_call`: the model requested a tool
/// - `tool_result`: a requested tool reached a terminal state
/// - `loop_detected`: the turn was halted by loop detection
/// - `compressed`: history was compressed before a model call
/// - `done`: the turn is over
/// - `error`: the model backend failed
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnEvent {
    Chunk {
        content: String,
    },

    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },

    ToolResult {
        id: String,
        name: String,
        output: String,
        status: ToolCallStatus,
        success: bool,
    },

    LoopDetected {
        kind: LoopKind,
        message: String,
    },

    Compressed {
        original_tokens: u64,
        new_tokens: u64,
    },

    Done {
        prompt_id: String,
        usage: Option<Usage>,
        iterations: usize,
        tool_calls_made: usize,
        stop: TurnStop,
    },

    Error {
        message: String,
    },
}

impl TurnEvent {
    /// Event name for this event type.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Chunk { .. } => "chunk",
            Self::ToolCall { .. } => "tool_call",
            Self::ToolResult { .. } => "tool_result",
            Self::LoopDetected { .. } => "loop_detected",
            Self::Compressed { .. } => "compressed",
            Self::Done { .. } => "done",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_chunk() {
        let event = TurnEvent::Chunk {
            content: "Hello".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"chunk""#));
        assert!(json.contains(r#""content":"Hello""#));
    }

    #[test]
    fn event_serialization_tool_result() {
        let event = TurnEvent::ToolResult {
            id: "call_1".into(),
            name: "file_read".into(),
            output: "contents".into(),
            status: ToolCallStatus::Success,
            success: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"tool_result""#));
        assert!(json.contains(r#""status":"success""#));
    }

    #[test]
    fn event_serialization_loop() {
        let event = TurnEvent::LoopDetected {
            kind: LoopKind::ConsecutiveIdenticalToolCalls,
            message: "stuck".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"loop_detected""#));
        assert!(json.contains(r#""kind":"CONSECUTIVE_IDENTICAL_TOOL_CALLS""#));
    }

    #[test]
    fn event_serialization_done() {
        let event = TurnEvent::Done {
            prompt_id: "abc".into(),
            usage: Some(Usage {
                prompt_tokens: 10,
                completion_tokens: 20,
                total_tokens: 30,
            }),
            iterations: 2,
            tool_calls_made: 1,
            stop: TurnStop::LoopDetected {
                kind: LoopKind::RepeatedToolName,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"done""#));
        assert!(json.contains(r#""iterations":2"#));
        assert!(json.contains(r#""reason":"loop_detected""#));
    }

    #[test]
    fn event_type_names() {
        assert_eq!(
            TurnEvent::Chunk {
                content: "x".into()
            }
            .event_type(),
            "chunk"
        );
        assert_eq!(
            TurnEvent::ToolCall {
                id: "a".into(),
                name: "b".into(),
                input: serde_json::Value::Null
            }
            .event_type(),
            "tool_call"
        );
        assert_eq!(
            TurnEvent::Compressed {
                original_tokens: 10,
                new_tokens: 5
            }
            .event_type(),
            "compressed"
        );
        assert_eq!(
            TurnEvent::Done {
                prompt_id: "x".into(),
                usage: None,
                iterations: 0,
                tool_calls_made: 0,
                stop: TurnStop::Completed,
            }
            .event_type(),
            "done"
        );
        assert_eq!(
            TurnEvent::Error {
                message: "x".into()
            }
            .event_type(),
            "error"
        );
    }

    #[test]
    fn event_deserialization() {
        let json = r#"{"type":"done","prompt_id":"p","usage":null,"iterations":1,"tool_calls_made":0,"stop":{"reason":"cancelled"}}"#;
        let event: TurnEvent = serde_json::from_str(json).unwrap();
        match event {
            TurnEvent::Done { stop, .. } => assert_eq!(stop, TurnStop::Cancelled),
            _ => panic!("Wrong variant"),
        }
    }
}
