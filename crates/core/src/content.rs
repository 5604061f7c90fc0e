//! Conversation content types.
//!
//! A conversation is an ordered list of [`Content`] turns. Each turn has a
//! [`Role`] and a list of [`Part`]s. Tool invocations travel as
//! `functionCall` parts in model turns and their results as
//! `functionResponse` parts in the following user turn:
//!
//! ```json
//! {"role":"model","parts":[{"functionCall":{"name":"shell","id":"c1","args":{}}}]}
//! {"role":"user","parts":[{"functionResponse":{"name":"shell","id":"c1","response":{"output":"ok"}}}]}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Result payload used for calls that never received a real response.
pub const CANCELLED_RESULT: &str = "user cancel";

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

/// A tool invocation emitted by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,

    /// Backends without call ids omit this.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub args: Value,
}

impl FunctionCall {
    pub fn new(name: impl Into<String>, id: Option<String>, args: Value) -> Self {
        Self {
            name: name.into(),
            id,
            args,
        }
    }
}

/// The result of a tool invocation, sent back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// One of `{"output": ..}`, `{"result": ..}` or `{"error": ..}`.
    pub response: Value,
}

impl FunctionResponse {
    /// A successful response carrying tool output.
    pub fn output(name: impl Into<String>, id: Option<String>, output: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id,
            response: serde_json::json!({ "output": output.into() }),
        }
    }

    /// An error response.
    pub fn error(name: impl Into<String>, id: Option<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id,
            response: serde_json::json!({ "error": message.into() }),
        }
    }

    /// The placeholder inserted for a call that was never answered.
    pub fn cancelled(name: impl Into<String>, id: Option<String>) -> Self {
        Self {
            name: name.into(),
            id,
            response: serde_json::json!({ "result": CANCELLED_RESULT }),
        }
    }

    /// Whether this is a `{"result": "user cancel"}` placeholder rather than
    /// a real tool result.
    pub fn is_cancel_placeholder(&self) -> bool {
        self.response.get("result").and_then(Value::as_str) == Some(CANCELLED_RESULT)
    }

    /// Whether this response reports an error.
    pub fn is_error(&self) -> bool {
        self.response.get("error").is_some()
    }
}

/// A single part of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text(String),
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn as_function_call(&self) -> Option<&FunctionCall> {
        match self {
            Self::FunctionCall(call) => Some(call),
            _ => None,
        }
    }

    pub fn as_function_response(&self) -> Option<&FunctionResponse> {
        match self {
            Self::FunctionResponse(response) => Some(response),
            _ => None,
        }
    }

    pub fn is_function_response(&self) -> bool {
        matches!(self, Self::FunctionResponse(_))
    }
}

/// One role-tagged turn of the conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: Role,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// A user turn with the given parts.
    pub fn user(parts: Vec<Part>) -> Self {
        Self::new(Role::User, parts)
    }

    /// A model turn with the given parts.
    pub fn model(parts: Vec<Part>) -> Self {
        Self::new(Role::Model, parts)
    }

    /// A user turn containing a single text part.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self::user(vec![Part::text(text)])
    }

    /// A model turn containing a single text part.
    pub fn model_text(text: impl Into<String>) -> Self {
        Self::model(vec![Part::text(text)])
    }

    pub fn function_calls(&self) -> impl Iterator<Item = &FunctionCall> {
        self.parts.iter().filter_map(Part::as_function_call)
    }

    pub fn function_responses(&self) -> impl Iterator<Item = &FunctionResponse> {
        self.parts.iter().filter_map(Part::as_function_response)
    }

    pub fn has_function_calls(&self) -> bool {
        self.function_calls().next().is_some()
    }

    pub fn has_function_responses(&self) -> bool {
        self.function_responses().next().is_some()
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn part_wire_shape() {
        let call = Part::FunctionCall(FunctionCall::new("search", Some("abc123".into()), json!({"q": "x"})));
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(
            value,
            json!({"functionCall": {"name": "search", "id": "abc123", "args": {"q": "x"}}})
        );

        let text = serde_json::to_value(Part::text("hi")).unwrap();
        assert_eq!(text, json!({"text": "hi"}));
    }

    #[test]
    fn missing_id_is_omitted_and_accepted() {
        let resp = Part::FunctionResponse(FunctionResponse::output("ls", None, "a.txt"));
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("\"id\""));

        let parsed: Part =
            serde_json::from_str(r#"{"functionResponse":{"name":"ls","response":{"output":"a.txt"}}}"#)
                .unwrap();
        assert_eq!(parsed, resp);
    }

    #[test]
    fn cancel_placeholder_detection() {
        assert!(FunctionResponse::cancelled("search", None).is_cancel_placeholder());
        assert!(!FunctionResponse::output("search", None, "user cancel").is_cancel_placeholder());
        assert!(FunctionResponse::error("search", None, "boom").is_error());
    }

    #[test]
    fn content_helpers() {
        let content = Content::model(vec![
            Part::text("Let me look. "),
            Part::FunctionCall(FunctionCall::new("ls", None, json!({}))),
            Part::text("Done."),
        ]);
        assert_eq!(content.text(), "Let me look. Done.");
        assert!(content.has_function_calls());
        assert!(!content.has_function_responses());
        assert_eq!(content.function_calls().count(), 1);
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&Content::user_text("hello")).unwrap();
        assert!(json.contains(r#""role":"user""#));
    }
}
