//! Tool call scheduler.
//!
//! Turns one model turn's worth of [`ToolCallRequest`]s into a batch of
//! concurrently executing, approval-gated, cancellable calls. Every call
//! runs its own pipeline that owns a [`ToolCallRecord`] and advances it
//! only through [`ToolCallRecord::apply`]. The batch resolves once, when
//! every pipeline has reached a terminal state, with results in request
//! order.

mod state;

pub use state::{
    ApprovalOutcome, CANCELLED_MESSAGE, CompletedToolCall, REJECTED_MESSAGE, ToolCallRecord,
    Transition, TransitionError, next_status,
};

use chrono::Utc;
use futures::future::join_all;
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use turnwright_core::approval::{
    ApprovalDecision, ApprovalHandler, ApprovalMode, ConfirmationRequest,
};
use turnwright_core::content::{Content, Part};
use turnwright_core::error::ToolError;
use turnwright_core::event::{DomainEvent, EventBus};
use turnwright_core::tool::{
    OutputSink, Tool, ToolCallRequest, ToolCallStatus, ToolOutput, ToolRegistry,
};

/// Every call of a batch, in request order, after all reached a terminal
/// state.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub calls: Vec<CompletedToolCall>,
    pub duration_ms: u64,
}

impl BatchOutcome {
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn count(&self, status: ToolCallStatus) -> usize {
        self.calls.iter().filter(|c| c.status == status).count()
    }

    pub fn get(&self, call_id: &str) -> Option<&CompletedToolCall> {
        self.calls.iter().find(|c| c.request.call_id == call_id)
    }

    /// `functionResponse` parts in request order.
    pub fn response_parts(&self) -> Vec<Part> {
        self.calls
            .iter()
            .map(|c| Part::FunctionResponse(c.response.clone()))
            .collect()
    }

    /// The user turn that answers the batch, or `None` for an empty batch.
    pub fn into_content(self) -> Option<Content> {
        if self.calls.is_empty() {
            return None;
        }
        Some(Content::user(self.response_parts()))
    }
}

enum ExecOutcome {
    Finished(Result<ToolOutput, ToolError>),
    Cancelled,
}

/// Schedules and executes batches of tool calls.
pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    approval_mode: ApprovalMode,
    approver: Option<Arc<dyn ApprovalHandler>>,
    event_bus: Arc<EventBus>,
    limiter: Option<Arc<Semaphore>>,
}

impl ToolScheduler {
    pub fn new(registry: Arc<ToolRegistry>, event_bus: Arc<EventBus>) -> Self {
        Self {
            registry,
            approval_mode: ApprovalMode::default(),
            approver: None,
            event_bus,
            limiter: None,
        }
    }

    pub fn with_approval_mode(mut self, mode: ApprovalMode) -> Self {
        self.approval_mode = mode;
        self
    }

    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.approver = Some(handler);
        self
    }

    /// Cap the number of tools executing at once.
    pub fn with_max_concurrency(mut self, limit: usize) -> Self {
        self.limiter = Some(Arc::new(Semaphore::new(limit.max(1))));
        self
    }

    pub fn set_approval_mode(&mut self, mode: ApprovalMode) {
        self.approval_mode = mode;
    }

    pub fn approval_mode(&self) -> ApprovalMode {
        self.approval_mode
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Run a batch to completion.
    ///
    /// Never fails: per-call problems end in `Error` or `Cancelled` with a
    /// response attached. Publishes a single `ToolBatchCompleted` event.
    pub async fn schedule(
        &self,
        requests: Vec<ToolCallRequest>,
        cancel: &CancellationToken,
    ) -> BatchOutcome {
        let started = Instant::now();
        debug!(batch_size = requests.len(), "Scheduling tool batch");

        let pipelines = requests
            .into_iter()
            .map(|request| self.run_call(request, cancel.clone()));
        let calls = join_all(pipelines).await;

        let outcome = BatchOutcome {
            calls,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let succeeded = outcome.count(ToolCallStatus::Success);
        let failed = outcome.count(ToolCallStatus::Error);
        let cancelled = outcome.count(ToolCallStatus::Cancelled);
        info!(
            batch_size = outcome.len(),
            succeeded,
            failed,
            cancelled,
            duration_ms = outcome.duration_ms,
            "Tool batch completed"
        );
        self.event_bus.publish(DomainEvent::ToolBatchCompleted {
            batch_size: outcome.len(),
            succeeded,
            failed,
            cancelled,
            duration_ms: outcome.duration_ms,
            timestamp: Utc::now(),
        });

        outcome
    }

    async fn run_call(&self, request: ToolCallRequest, cancel: CancellationToken) -> CompletedToolCall {
        let mut record = ToolCallRecord::new(request);
        self.publish_status(&record);
        self.drive(&mut record, &cancel).await;
        record.into_completed()
    }

    fn advance(&self, record: &mut ToolCallRecord, transition: Transition) {
        match record.apply(transition) {
            Ok(_) => self.publish_status(record),
            Err(e) => warn!(error = %e, "Ignoring illegal tool call transition"),
        }
    }

    fn publish_status(&self, record: &ToolCallRecord) {
        self.event_bus.publish(DomainEvent::ToolCallStatusChanged {
            call_id: record.call_id().to_string(),
            tool_name: record.tool_name().to_string(),
            status: record.status,
            timestamp: Utc::now(),
        });
    }

    async fn drive(&self, record: &mut ToolCallRecord, cancel: &CancellationToken) {
        if cancel.is_cancelled() {
            self.advance(record, Transition::Cancel);
            return;
        }

        let Some(tool) = self.registry.lookup(record.tool_name()) else {
            debug!(tool = %record.tool_name(), call_id = %record.call_id(), "Tool not found");
            self.advance(record, Transition::NotFound);
            return;
        };
        let kind = tool.kind();
        record.kind = Some(kind);

        if let Err(e) = self.registry.validate_args(record.tool_name(), &record.args) {
            debug!(tool = %record.tool_name(), error = %e, "Tool arguments rejected");
            self.advance(record, Transition::InvalidArgs(e));
            return;
        }

        if self.approval_mode.requires_confirmation(kind) {
            self.advance(record, Transition::NeedsApproval);
            let Some(decision) = self.ask_approval(record, cancel).await else {
                self.advance(record, Transition::Cancel);
                return;
            };
            match decision {
                ApprovalDecision::Accept => self.advance(record, Transition::Approved),
                ApprovalDecision::Reject => {
                    info!(tool = %record.tool_name(), call_id = %record.call_id(), "Tool call rejected");
                    self.advance(record, Transition::Rejected);
                    return;
                }
                ApprovalDecision::Modify { args } => {
                    let args = if args.is_null() {
                        serde_json::json!({})
                    } else {
                        args
                    };
                    if let Err(e) = self.registry.validate_args(record.tool_name(), &args) {
                        self.advance(record, Transition::InvalidArgs(e));
                        return;
                    }
                    self.advance(record, Transition::ModifiedArgs(args));
                }
            }
        } else {
            self.advance(record, Transition::AutoApproved);
        }

        let Some(_permit) = self.acquire_slot(cancel).await else {
            self.advance(record, Transition::Cancel);
            return;
        };
        if cancel.is_cancelled() {
            self.advance(record, Transition::Cancel);
            return;
        }

        self.advance(record, Transition::Start);
        match self.execute(tool, record, cancel).await {
            ExecOutcome::Finished(Ok(output)) => {
                self.advance(record, Transition::Succeeded(output));
            }
            ExecOutcome::Finished(Err(e)) => {
                debug!(tool = %record.tool_name(), error = %e, "Tool execution failed");
                self.advance(record, Transition::Failed(e));
            }
            ExecOutcome::Cancelled => self.advance(record, Transition::Cancel),
        }
    }

    /// Returns `None` when the batch was cancelled while waiting.
    async fn ask_approval(
        &self,
        record: &ToolCallRecord,
        cancel: &CancellationToken,
    ) -> Option<ApprovalDecision> {
        let Some(approver) = &self.approver else {
            debug!(tool = %record.tool_name(), "No approval handler configured, rejecting");
            return Some(ApprovalDecision::Reject);
        };
        let request = ConfirmationRequest {
            call_id: record.call_id().to_string(),
            tool_name: record.tool_name().to_string(),
            kind: record.kind.unwrap_or(turnwright_core::tool::ToolKind::Other),
            args: record.args.clone(),
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            decision = approver.confirm(request) => Some(decision),
        }
    }

    /// Wait for a concurrency slot. `Some(None)` means no limit is set.
    async fn acquire_slot(&self, cancel: &CancellationToken) -> Option<Option<OwnedSemaphorePermit>> {
        let Some(limiter) = &self.limiter else {
            return Some(None);
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            permit = limiter.clone().acquire_owned() => permit.ok().map(Some),
        }
    }

    async fn execute(
        &self,
        tool: Arc<dyn Tool>,
        record: &ToolCallRecord,
        cancel: &CancellationToken,
    ) -> ExecOutcome {
        let sink = {
            let bus = self.event_bus.clone();
            let call_id = record.call_id().to_string();
            OutputSink::new(move |chunk| {
                bus.publish(DomainEvent::ToolOutputChunk {
                    call_id: call_id.clone(),
                    chunk: chunk.to_string(),
                })
            })
        };

        let args = record.args.clone();
        let token = cancel.clone();
        let mut handle = tokio::spawn(async move { tool.execute(args, token, sink).await });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                handle.abort();
                ExecOutcome::Cancelled
            }
            joined = &mut handle => match joined {
                Ok(Ok(output)) => ExecOutcome::Finished(Ok(output)),
                Ok(Err(ToolError::Cancelled(_))) => ExecOutcome::Cancelled,
                Ok(Err(e)) => ExecOutcome::Finished(Err(e)),
                Err(join_err) if join_err.is_panic() => {
                    let message = panic_message(join_err.into_panic());
                    warn!(tool = %record.tool_name(), panic = %message, "Tool panicked");
                    ExecOutcome::Finished(Err(ToolError::failed(
                        record.tool_name(),
                        format!("tool panicked: {message}"),
                    )))
                }
                Err(_) => ExecOutcome::Cancelled,
            },
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
