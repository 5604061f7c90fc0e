//! # Turnwright Core
//!
//! Domain types, traits, and error definitions for the Turnwright turn
//! execution engine. This crate defines the conversation model and the
//! narrow collaborator interfaces (tools, approval, model backend) that the
//! execution core in `turnwright-agent` is written against.
//!
//! ## Design Philosophy
//!
//! Every collaborator is a trait here. Implementations live elsewhere.
//! This enables:
//! - Swapping backends and tool sets without touching the core
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod approval;
pub mod content;
pub mod error;
pub mod event;
pub mod model;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use approval::{ApprovalDecision, ApprovalHandler, ApprovalMode, ConfirmationRequest};
pub use content::{CANCELLED_RESULT, Content, FunctionCall, FunctionResponse, Part, Role};
pub use error::{Error, ModelError, Result, ToolError};
pub use event::{DomainEvent, EventBus, LoopKind};
pub use model::{
    FinishReason, ModelClient, ModelRequest, ModelResponse, ModelStream, ModelStreamEvent, Usage,
};
pub use tool::{
    OutputSink, Tool, ToolCallRequest, ToolCallStatus, ToolDefinition, ToolKind, ToolOutput,
    ToolRegistry,
};
pub use tokio_util::sync::CancellationToken;
