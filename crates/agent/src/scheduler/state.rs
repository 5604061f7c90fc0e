//! Tool call records and the state machine that advances them.
//!
//! ```text
//! Validating ──NotFound/InvalidArgs──▶ Error
//!     │ NeedsApproval              │ AutoApproved
//!     ▼                            ▼
//! AwaitingApproval ──Approved/ModifiedArgs──▶ Scheduled ──Start──▶ Executing
//!     │ Rejected                                               │
//!     ▼                                       Succeeded/Failed/Cancel
//! Cancelled ◀──────────── Cancel (from any non-terminal state) ─┘
//! ```
//!
//! [`next_status`] is the pure transition table. [`ToolCallRecord::apply`]
//! is the only way a record changes state.

use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use thiserror::Error;
use turnwright_core::content::FunctionResponse;
use turnwright_core::error::ToolError;
use turnwright_core::tool::{ToolCallRequest, ToolCallStatus, ToolKind, ToolOutput};

/// Response text given to calls that were cancelled mid-batch.
pub const CANCELLED_MESSAGE: &str = "Tool call was cancelled before it completed.";

/// Response text given to calls the user declined.
pub const REJECTED_MESSAGE: &str = "Tool call was rejected by the user.";

/// An event that moves a record through the state machine.
#[derive(Debug, Clone)]
pub enum Transition {
    NotFound,
    InvalidArgs(ToolError),
    NeedsApproval,
    AutoApproved,
    Approved,
    Rejected,
    ModifiedArgs(Value),
    Start,
    Succeeded(ToolOutput),
    Failed(ToolError),
    Cancel,
}

impl Transition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::InvalidArgs(_) => "invalid_args",
            Self::NeedsApproval => "needs_approval",
            Self::AutoApproved => "auto_approved",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::ModifiedArgs(_) => "modified_args",
            Self::Start => "start",
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::Cancel => "cancel",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition '{transition}' from {from:?} for call {call_id}")]
pub struct TransitionError {
    pub call_id: String,
    pub from: ToolCallStatus,
    pub transition: &'static str,
}

/// How the approval step resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    /// The call never reached the approval step.
    Skipped,
    /// Policy did not require confirmation.
    AutoApproved,
    Accepted,
    Rejected,
    Modified,
}

/// Compute the status `transition` leads to from `from`.
pub fn next_status(
    from: ToolCallStatus,
    transition: &Transition,
) -> Option<ToolCallStatus> {
    use ToolCallStatus::*;
    use Transition as T;

    let to = match (from, transition) {
        (Validating, T::NotFound) => Error,
        (Validating | AwaitingApproval, T::InvalidArgs(_)) => Error,
        (Validating, T::NeedsApproval) => AwaitingApproval,
        (Validating, T::AutoApproved) => Scheduled,
        (AwaitingApproval, T::Approved | T::ModifiedArgs(_)) => Scheduled,
        (AwaitingApproval, T::Rejected) => Cancelled,
        (Scheduled, T::Start) => Executing,
        (Executing, T::Succeeded(_)) => Success,
        (Executing, T::Failed(_)) => Error,
        (status, T::Cancel) if !status.is_terminal() => Cancelled,
        _ => return None,
    };
    Some(to)
}

/// The scheduler's view of one call in a batch.
#[derive(Debug, Clone)]
pub struct ToolCallRecord {
    pub request: ToolCallRequest,
    /// Arguments that will actually run; replaced on modification.
    pub args: Value,
    pub status: ToolCallStatus,
    pub kind: Option<ToolKind>,
    pub approval: ApprovalOutcome,
    pub response: Option<FunctionResponse>,
    pub error: Option<ToolError>,
    pub output: Option<ToolOutput>,
    started_at: Instant,
}

impl ToolCallRecord {
    pub fn new(request: ToolCallRequest) -> Self {
        let args = match &request.args {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        Self {
            request,
            args,
            status: ToolCallStatus::Validating,
            kind: None,
            approval: ApprovalOutcome::Skipped,
            response: None,
            error: None,
            output: None,
            started_at: Instant::now(),
        }
    }

    pub fn call_id(&self) -> &str {
        &self.request.call_id
    }

    pub fn tool_name(&self) -> &str {
        &self.request.name
    }

    fn respond_error(&mut self, message: impl Into<String>) {
        self.response = Some(FunctionResponse::error(
            self.request.name.clone(),
            Some(self.request.call_id.clone()),
            message,
        ));
    }

    /// Advance the record. Illegal transitions leave it untouched.
    pub fn apply(&mut self, transition: Transition) -> Result<ToolCallStatus, TransitionError> {
        let Some(to) = next_status(self.status, &transition) else {
            return Err(TransitionError {
                call_id: self.request.call_id.clone(),
                from: self.status,
                transition: transition.name(),
            });
        };

        match transition {
            Transition::NotFound => {
                let err = ToolError::NotFound(self.request.name.clone());
                self.respond_error(err.to_string());
                self.error = Some(err);
            }
            Transition::InvalidArgs(err) | Transition::Failed(err) => {
                self.respond_error(err.to_string());
                self.error = Some(err);
            }
            Transition::NeedsApproval | Transition::Start => {}
            Transition::AutoApproved => self.approval = ApprovalOutcome::AutoApproved,
            Transition::Approved => self.approval = ApprovalOutcome::Accepted,
            Transition::Rejected => {
                self.approval = ApprovalOutcome::Rejected;
                self.respond_error(REJECTED_MESSAGE);
                self.error = Some(ToolError::PermissionDenied {
                    tool_name: self.request.name.clone(),
                    reason: "rejected by user".into(),
                });
            }
            Transition::ModifiedArgs(args) => {
                self.approval = ApprovalOutcome::Modified;
                self.args = args;
            }
            Transition::Succeeded(output) => {
                self.response = Some(FunctionResponse::output(
                    self.request.name.clone(),
                    Some(self.request.call_id.clone()),
                    output.output.clone(),
                ));
                self.output = Some(output);
            }
            Transition::Cancel => {
                self.respond_error(CANCELLED_MESSAGE);
                self.error = Some(ToolError::Cancelled(self.request.name.clone()));
            }
        }

        self.status = to;
        Ok(to)
    }

    /// Freeze a terminal record into its completed form.
    pub fn into_completed(self) -> CompletedToolCall {
        let duration_ms = self.started_at.elapsed().as_millis() as u64;
        let response = self.response.unwrap_or_else(|| {
            FunctionResponse::cancelled(
                self.request.name.clone(),
                Some(self.request.call_id.clone()),
            )
        });
        CompletedToolCall {
            request: ToolCallRequest {
                args: self.args,
                ..self.request
            },
            status: self.status,
            kind: self.kind,
            approval: self.approval,
            response,
            error: self.error,
            output: self.output,
            duration_ms,
        }
    }
}

/// A call that reached a terminal state, with the response that goes back
/// to the model.
#[derive(Debug, Clone)]
pub struct CompletedToolCall {
    /// The request as executed (modified arguments included).
    pub request: ToolCallRequest,
    pub status: ToolCallStatus,
    pub kind: Option<ToolKind>,
    pub approval: ApprovalOutcome,
    pub response: FunctionResponse,
    pub error: Option<ToolError>,
    pub output: Option<ToolOutput>,
    pub duration_ms: u64,
}

impl CompletedToolCall {
    pub fn succeeded(&self) -> bool {
        self.status == ToolCallStatus::Success
    }
}
