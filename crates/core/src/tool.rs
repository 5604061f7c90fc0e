//! Tool trait: the abstraction over side-effecting agent capabilities.
//!
//! Tools are what give the model the ability to act in the world:
//! run shell commands, read and edit files, search, etc. The scheduler
//! looks tools up in a [`ToolRegistry`], validates arguments against the
//! tool's JSON schema and drives `execute` with a cancellation token and an
//! [`OutputSink`] for live partial output.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ToolError;

/// A tool invocation requested by the model. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallRequest {
    /// Unique call ID (matches the model's function call id)
    pub call_id: String,

    /// Name of the tool to execute
    pub name: String,

    /// Arguments as a JSON value
    #[serde(default)]
    pub args: Value,
}

impl ToolCallRequest {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            args,
        }
    }
}

/// What a tool does to the world. Drives approval policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Reads files, searches, lists. Never needs confirmation.
    Read,
    /// Modifies files in the workspace.
    Edit,
    /// Runs arbitrary commands.
    Execute,
    /// Anything else; treated as mutating.
    Other,
}

impl ToolKind {
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Read)
    }
}

/// Lifecycle state of one tool call within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Validating,
    AwaitingApproval,
    Scheduled,
    Executing,
    Success,
    Error,
    Cancelled,
}

impl ToolCallStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error | Self::Cancelled)
    }
}

/// Successful tool output.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Text sent back to the model
    pub output: String,

    /// Short human-readable summary for the UI
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl ToolOutput {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            summary: None,
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }
}

/// Receives live output chunks from a running tool.
///
/// The scheduler forwards chunks to observers; nothing is stored.
#[derive(Clone, Default)]
pub struct OutputSink {
    callback: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl OutputSink {
    pub fn new(callback: impl Fn(&str) + Send + Sync + 'static) -> Self {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    /// A sink that discards everything.
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn emit(&self, chunk: &str) {
        if let Some(callback) = &self.callback {
            callback(chunk);
        }
    }
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputSink")
            .field("attached", &self.callback.is_some())
            .finish()
    }
}

/// A tool definition sent to the model so it knows what it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema describing the tool's parameters
    pub parameters: Value,
}

/// The core Tool trait.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "shell", "file_read").
    fn name(&self) -> &str;

    /// A description of what this tool does (sent to the model).
    fn description(&self) -> &str;

    /// JSON Schema describing this tool's parameters.
    fn parameters_schema(&self) -> Value;

    /// What kind of side effects this tool has.
    fn kind(&self) -> ToolKind {
        ToolKind::Other
    }

    /// Execute the tool.
    ///
    /// Implementations should stop promptly once `cancel` fires and may
    /// stream partial output through `output`.
    async fn execute(
        &self,
        args: Value,
        cancel: CancellationToken,
        output: OutputSink,
    ) -> std::result::Result<ToolOutput, ToolError>;

    /// Validate arguments against [`Tool::parameters_schema`].
    fn validate_arguments(&self, args: &Value) -> std::result::Result<(), ToolError> {
        let schema = self.parameters_schema();
        let validator = jsonschema::validator_for(&schema).map_err(|e| {
            ToolError::invalid_args(self.name(), format!("tool declares an invalid schema: {e}"))
        })?;
        validator
            .validate(args)
            .map_err(|e| ToolError::invalid_args(self.name(), e.to_string()))
    }

    /// Convert this tool into a ToolDefinition for sending to the model.
    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// A registry of available tools.
///
/// Argument schemas are compiled once, when a tool is registered.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
    validators: HashMap<String, jsonschema::Validator>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        match jsonschema::validator_for(&tool.parameters_schema()) {
            Ok(validator) => {
                self.validators.insert(name.clone(), validator);
            }
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool declares an invalid parameter schema");
                self.validators.remove(&name);
            }
        }
        if self.tools.insert(name.clone(), tool).is_some() {
            warn!(tool = %name, "Replaced an already registered tool");
        }
    }

    /// Validate `args` for the named tool with its precompiled schema.
    pub fn validate_args(&self, name: &str, args: &Value) -> std::result::Result<(), ToolError> {
        if let Some(validator) = self.validators.get(name) {
            return validator
                .validate(args)
                .map_err(|e| ToolError::invalid_args(name, e.to_string()));
        }
        match self.tools.get(name) {
            Some(tool) => tool.validate_arguments(args),
            None => Err(ToolError::NotFound(name.to_string())),
        }
    }

    /// Look up a tool by name.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Tool definitions sorted by name, for sending to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<_> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// List all registered tool names.
    pub fn names(&self) -> Vec<&str> {
        self.tools.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = self.names();
        names.sort_unstable();
        f.debug_struct("ToolRegistry").field("tools", &names).finish()
    }
}
