//! Model client trait: the abstraction over language-model backends.
//!
//! A backend streams [`ModelStreamEvent`]s for a request. The stream is a
//! bounded channel; dropping the receiver tells the producer to stop, and
//! implementations are expected to watch the cancellation token and close
//! their transport as soon as it fires.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::content::{Content, FunctionCall, Part};
use crate::error::ModelError;
use crate::tool::{ToolCallRequest, ToolDefinition};

/// A request to the model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRequest {
    /// The model to use (e.g., "gemini-2.5-pro")
    pub model: String,

    /// The conversation so far
    pub contents: Vec<Content>,

    /// Optional system instruction
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<String>,

    /// Tools the model may call
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,

    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Ask the backend for a JSON-only answer
    #[serde(default)]
    pub json_response: bool,
}

impl ModelRequest {
    pub fn new(model: impl Into<String>, contents: Vec<Content>) -> Self {
        Self {
            model: model.into(),
            contents,
            system_instruction: None,
            tools: Vec::new(),
            temperature: None,
            json_response: false,
        }
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_json_response(mut self) -> Self {
        self.json_response = true;
        self
    }
}

/// Token usage information.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    Safety,
    Other,
}

/// One event from a streaming model response.
#[derive(Debug, Clone)]
pub enum ModelStreamEvent {
    /// Partial text from the model.
    Content(String),
    /// The model wants a tool invoked.
    ToolCallRequest(ToolCallRequest),
    /// Usage metadata, usually near the end of the stream.
    Usage(Usage),
    /// The backend failed mid-stream.
    Error(ModelError),
    /// The stream is complete.
    Finished(FinishReason),
}

/// Receiver side of a streaming response.
pub type ModelStream = mpsc::Receiver<ModelStreamEvent>;

/// A complete (non-streaming) model response.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: Content,
    pub usage: Option<Usage>,
    pub finish_reason: Option<FinishReason>,
}

impl ModelResponse {
    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// The model backend collaborator.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// A human-readable name for this backend.
    fn name(&self) -> &str;

    /// Start a streaming generation.
    async fn generate_content_stream(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelStream, ModelError>;

    /// Run a generation to completion.
    ///
    /// Default implementation drains [`ModelClient::generate_content_stream`].
    async fn generate_content(
        &self,
        request: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ModelResponse, ModelError> {
        let mut stream = self.generate_content_stream(request, cancel.clone()).await?;
        let mut text = String::new();
        let mut parts = Vec::new();
        let mut usage = None;
        let mut finish_reason = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ModelError::Cancelled),
                event = stream.recv() => event,
            };
            match event {
                Some(ModelStreamEvent::Content(chunk)) => text.push_str(&chunk),
                Some(ModelStreamEvent::ToolCallRequest(req)) => {
                    parts.push(Part::FunctionCall(FunctionCall::new(
                        req.name,
                        Some(req.call_id),
                        req.args,
                    )));
                }
                Some(ModelStreamEvent::Usage(u)) => usage = Some(u),
                Some(ModelStreamEvent::Error(e)) => return Err(e),
                Some(ModelStreamEvent::Finished(reason)) => {
                    finish_reason = Some(reason);
                    break;
                }
                None => break,
            }
        }

        if !text.is_empty() {
            parts.insert(0, Part::Text(text));
        }
        if parts.is_empty() {
            return Err(ModelError::EmptyResponse);
        }

        Ok(ModelResponse {
            content: Content::model(parts),
            usage,
            finish_reason,
        })
    }

    /// Count the tokens `contents` would occupy for `model`.
    async fn count_tokens(&self, model: &str, contents: &[Content]) -> Result<u64, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Streams a fixed list of events.
    struct CannedClient {
        events: Vec<ModelStreamEvent>,
    }

    #[async_trait]
    impl ModelClient for CannedClient {
        fn name(&self) -> &str {
            "canned"
        }

        async fn generate_content_stream(
            &self,
            _request: ModelRequest,
            _cancel: CancellationToken,
        ) -> Result<ModelStream, ModelError> {
            let (tx, rx) = mpsc::channel(self.events.len().max(1));
            for event in self.events.clone() {
                tx.send(event).await.unwrap();
            }
            Ok(rx)
        }

        async fn count_tokens(&self, _model: &str, _contents: &[Content]) -> Result<u64, ModelError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn generate_content_collects_stream() {
        let client = CannedClient {
            events: vec![
                ModelStreamEvent::Content("Hello, ".into()),
                ModelStreamEvent::Content("world".into()),
                ModelStreamEvent::ToolCallRequest(ToolCallRequest::new(
                    "c1",
                    "ls",
                    serde_json::json!({}),
                )),
                ModelStreamEvent::Usage(Usage {
                    prompt_tokens: 3,
                    completion_tokens: 2,
                    total_tokens: 5,
                }),
                ModelStreamEvent::Finished(FinishReason::Stop),
            ],
        };
        let response = client
            .generate_content(ModelRequest::new("m", vec![]), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.text(), "Hello, world");
        assert_eq!(response.content.function_calls().count(), 1);
        assert_eq!(response.usage.unwrap().total_tokens, 5);
        assert_eq!(response.finish_reason, Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn generate_content_surfaces_stream_error() {
        let client = CannedClient {
            events: vec![ModelStreamEvent::Error(ModelError::Network("reset".into()))],
        };
        let err = client
            .generate_content(ModelRequest::new("m", vec![]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Network(_)));
    }

    #[tokio::test]
    async fn empty_stream_is_an_error() {
        let client = CannedClient {
            events: vec![ModelStreamEvent::Finished(FinishReason::Stop)],
        };
        let err = client
            .generate_content(ModelRequest::new("m", vec![]), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::EmptyResponse));
    }

    #[tokio::test]
    async fn cancelled_generation_returns_cancelled() {
        let client = CannedClient { events: vec![] };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .generate_content(ModelRequest::new("m", vec![]), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ModelError::Cancelled));
    }
}
