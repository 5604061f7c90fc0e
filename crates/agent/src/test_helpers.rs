//! Shared test helpers: a scripted model client, a handful of tools with
//! predictable behaviour and a scripted approver.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use turnwright_core::approval::{ApprovalDecision, ApprovalHandler, ConfirmationRequest};
use turnwright_core::content::Content;
use turnwright_core::error::{ModelError, ToolError};
use turnwright_core::model::{
    FinishReason, ModelClient, ModelRequest, ModelStream, ModelStreamEvent, Usage,
};
use turnwright_core::tool::{
    OutputSink, Tool, ToolCallRequest, ToolKind, ToolOutput, ToolRegistry,
};

use crate::compression::estimate_history_tokens;

/// One scripted reply: the events to stream, or an error from the call.
pub type ScriptEntry = Result<Vec<ModelStreamEvent>, ModelError>;

/// A model client that replays scripted replies in order.
pub struct ScriptedModel {
    script: Mutex<VecDeque<ScriptEntry>>,
    requests: Mutex<Vec<ModelRequest>>,
    token_counts: Mutex<VecDeque<u64>>,
    failing_token_count: bool,
}

impl ScriptedModel {
    pub fn new(script: Vec<ScriptEntry>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            token_counts: Mutex::new(VecDeque::new()),
            failing_token_count: false,
        }
    }

    /// Report `count` for every token count request.
    pub fn with_token_count(self, count: u64) -> Self {
        self.with_token_counts(vec![count])
    }

    /// Report these counts in order; the last one repeats.
    pub fn with_token_counts(self, counts: Vec<u64>) -> Self {
        *self.token_counts.lock().unwrap() = counts.into();
        self
    }

    pub fn with_failing_token_count(mut self) -> Self {
        self.failing_token_count = true;
        self
    }

    pub fn text(text: &str) -> ScriptEntry {
        Ok(vec![
            ModelStreamEvent::Content(text.to_string()),
            ModelStreamEvent::Usage(usage()),
            ModelStreamEvent::Finished(FinishReason::Stop),
        ])
    }

    pub fn tool_calls(calls: Vec<(&str, &str, Value)>) -> ScriptEntry {
        let mut events: Vec<ModelStreamEvent> = calls
            .into_iter()
            .map(|(id, name, args)| {
                ModelStreamEvent::ToolCallRequest(ToolCallRequest::new(id, name, args))
            })
            .collect();
        events.push(ModelStreamEvent::Usage(usage()));
        events.push(ModelStreamEvent::Finished(FinishReason::Stop));
        Ok(events)
    }

    pub fn failure(error: ModelError) -> ScriptEntry {
        Err(error)
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.script.lock().unwrap().len()
    }
}

pub fn usage() -> Usage {
    Usage {
        prompt_tokens: 10,
        completion_tokens: 5,
        total_tokens: 15,
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate_content_stream(
        &self,
        request: ModelRequest,
        _cancel: CancellationToken,
    ) -> Result<ModelStream, ModelError> {
        self.requests.lock().unwrap().push(request);
        let entry = self.script.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(ModelError::ApiError {
                status_code: 500,
                message: "script exhausted".into(),
            })
        })?;

        let (tx, rx) = mpsc::channel(entry.len().max(1));
        for event in entry {
            tx.try_send(event).unwrap();
        }
        Ok(rx)
    }

    async fn count_tokens(&self, _model: &str, contents: &[Content]) -> Result<u64, ModelError> {
        if self.failing_token_count {
            return Err(ModelError::TokenCount("counter offline".into()));
        }
        let mut counts = self.token_counts.lock().unwrap();
        match counts.len() {
            0 => Ok(estimate_history_tokens(contents)),
            1 => Ok(counts[0]),
            _ => Ok(counts.pop_front().unwrap()),
        }
    }
}

pub fn registry_with(tools: Vec<Arc<dyn Tool>>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(tool);
    }
    registry
}

/// Returns its `text` argument.
pub struct EchoTool {
    name: String,
    kind: ToolKind,
}

impl EchoTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ToolKind::Read,
        }
    }

    pub fn with_kind(mut self, kind: ToolKind) -> Self {
        self.kind = kind;
        self
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Echo the input text"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    fn kind(&self) -> ToolKind {
        self.kind
    }

    async fn execute(
        &self,
        args: Value,
        _cancel: CancellationToken,
        _output: OutputSink,
    ) -> Result<ToolOutput, ToolError> {
        Ok(ToolOutput::new(args["text"].as_str().unwrap_or_default()))
    }
}

/// Sleeps, then succeeds. Stops early when cancelled.
pub struct SlowTool {
    name: String,
    delay: Duration,
}

impl SlowTool {
    pub fn new(name: &str, delay: Duration) -> Self {
        Self {
            name: name.to_string(),
            delay,
        }
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Wait, then finish"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    async fn execute(
        &self,
        _args: Value,
        cancel: CancellationToken,
        _output: OutputSink,
    ) -> Result<ToolOutput, ToolError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ToolError::Cancelled(self.name.clone())),
            _ = tokio::time::sleep(self.delay) => Ok(ToolOutput::new("done")),
        }
    }
}

/// Always fails.
pub struct FailingTool {
    name: String,
}

impl FailingTool {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Fail every time"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    async fn execute(
        &self,
        _args: Value,
        _cancel: CancellationToken,
        _output: OutputSink,
    ) -> Result<ToolOutput, ToolError> {
        Err(ToolError::failed(&self.name, "disk on fire"))
    }
}

/// Panics when executed.
pub struct PanickingTool;

#[async_trait]
impl Tool for PanickingTool {
    fn name(&self) -> &str {
        "panics"
    }

    fn description(&self) -> &str {
        "Panic"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    async fn execute(
        &self,
        _args: Value,
        _cancel: CancellationToken,
        _output: OutputSink,
    ) -> Result<ToolOutput, ToolError> {
        panic!("tool blew up");
    }
}

/// Emits two output chunks.
pub struct StreamingTool;

#[async_trait]
impl Tool for StreamingTool {
    fn name(&self) -> &str {
        "stream"
    }

    fn description(&self) -> &str {
        "Stream two lines"
    }

    fn parameters_schema(&self) -> Value {
        json!({ "type": "object" })
    }

    fn kind(&self) -> ToolKind {
        ToolKind::Read
    }

    async fn execute(
        &self,
        _args: Value,
        _cancel: CancellationToken,
        output: OutputSink,
    ) -> Result<ToolOutput, ToolError> {
        output.emit("one");
        output.emit("two");
        Ok(ToolOutput::new("one\ntwo"))
    }
}

/// Answers confirmation requests from a table keyed by call id. Unlisted
/// calls are accepted.
pub struct ScriptedApprover {
    decisions: Mutex<HashMap<String, ApprovalDecision>>,
    asked: AtomicUsize,
}

impl ScriptedApprover {
    pub fn new(decisions: Vec<(&str, ApprovalDecision)>) -> Self {
        Self {
            decisions: Mutex::new(
                decisions
                    .into_iter()
                    .map(|(id, d)| (id.to_string(), d))
                    .collect(),
            ),
            asked: AtomicUsize::new(0),
        }
    }

    pub fn asked(&self) -> usize {
        self.asked.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ApprovalHandler for ScriptedApprover {
    async fn confirm(&self, request: ConfirmationRequest) -> ApprovalDecision {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.decisions
            .lock()
            .unwrap()
            .remove(&request.call_id)
            .unwrap_or(ApprovalDecision::Accept)
    }
}
