//! The thin turn loop that drives one user prompt to completion.

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use turnwright_config::EngineConfig;
use turnwright_core::approval::{ApprovalHandler, ApprovalMode};
use turnwright_core::content::{Content, FunctionCall, Part};
use turnwright_core::error::{Error, ModelError};
use turnwright_core::event::{DomainEvent, EventBus};
use turnwright_core::model::{ModelClient, ModelRequest, ModelStreamEvent, Usage};
use turnwright_core::tool::{ToolCallRequest, ToolRegistry};
use uuid::Uuid;

use crate::compression::{ChatCompressor, CompressionResult, CompressionStatus};
use crate::loop_detection::LoopDetector;
use crate::reconcile::{Reconciled, reconcile};
use crate::scheduler::{BatchOutcome, ToolScheduler};
use crate::stream_event::{TurnEvent, TurnStop};

/// Result of [`TurnLoop::run_turn`].
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub prompt_id: String,
    pub stop: TurnStop,
    /// Text of the final model answer. Empty unless the turn completed.
    pub text: String,
    pub iterations: usize,
    pub tool_calls_made: usize,
    pub usage: Option<Usage>,
}

/// What one streamed model response produced.
#[derive(Default)]
struct StreamedResponse {
    text: String,
    calls: Vec<ToolCallRequest>,
    usage: Option<Usage>,
    loop_detected: bool,
    cancelled: bool,
}

impl StreamedResponse {
    fn to_content(&self) -> Option<Content> {
        let mut parts = Vec::with_capacity(self.calls.len() + 1);
        if !self.text.is_empty() {
            parts.push(Part::Text(self.text.clone()));
        }
        parts.extend(self.calls.iter().map(|c| {
            Part::FunctionCall(FunctionCall::new(
                c.name.clone(),
                Some(c.call_id.clone()),
                c.args.clone(),
            ))
        }));
        (!parts.is_empty()).then(|| Content::model(parts))
    }
}

/// Orchestrates model calls, tool batches, loop detection, compression
/// and reconciliation for one conversation.
pub struct TurnLoop {
    /// The model backend
    client: Arc<dyn ModelClient>,

    /// The model to use
    model: String,

    /// Maximum model round-trips per prompt
    max_iterations: u32,

    system_instruction: Option<String>,

    /// Conversation history, owned here only
    history: Vec<Content>,

    scheduler: ToolScheduler,
    detector: LoopDetector,
    compressor: ChatCompressor,

    /// Cleared after a compression that grew the history
    auto_compress: bool,

    event_bus: Arc<EventBus>,
    events: Option<mpsc::UnboundedSender<TurnEvent>>,
}

impl TurnLoop {
    pub fn new(
        client: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        config: &EngineConfig,
        event_bus: Arc<EventBus>,
    ) -> Self {
        let mut scheduler =
            ToolScheduler::new(tools, event_bus.clone()).with_approval_mode(config.approval_mode);
        if let Some(limit) = config.scheduler.max_concurrency {
            scheduler = scheduler.with_max_concurrency(limit);
        }
        let detector = LoopDetector::new(config.loop_detection.clone(), event_bus.clone())
            .with_semantic_check(client.clone(), config.model.clone());
        let compressor = ChatCompressor::new(
            config.compression.clone(),
            config.model_limits.clone(),
            event_bus.clone(),
        );

        Self {
            client,
            model: config.model.clone(),
            max_iterations: config.max_turn_iterations,
            system_instruction: None,
            history: Vec::new(),
            scheduler,
            detector,
            compressor,
            auto_compress: true,
            event_bus,
            events: None,
        }
    }

    /// Route confirmation requests to `handler`.
    pub fn with_approval_handler(mut self, handler: Arc<dyn ApprovalHandler>) -> Self {
        self.scheduler = self.scheduler.with_approval_handler(handler);
        self
    }

    pub fn with_system_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.system_instruction = Some(instruction.into());
        self
    }

    /// Stream [`TurnEvent`]s to `sender` while turns run.
    pub fn with_event_sender(mut self, sender: mpsc::UnboundedSender<TurnEvent>) -> Self {
        self.events = Some(sender);
        self
    }

    /// Resume from an existing history.
    pub fn with_history(mut self, history: Vec<Content>) -> Self {
        self.history = history;
        self
    }

    pub fn history(&self) -> &[Content] {
        &self.history
    }

    pub fn set_approval_mode(&mut self, mode: ApprovalMode) {
        self.scheduler.set_approval_mode(mode);
    }

    pub fn disable_loop_detection(&mut self) {
        self.detector.disable_for_session();
    }

    fn emit(&self, event: TurnEvent) {
        if let Some(tx) = &self.events {
            // A dropped receiver only means nobody is listening.
            let _ = tx.send(event);
        }
    }

    /// Process one user prompt.
    ///
    /// Each iteration reconciles the history, compresses it when it has
    /// grown too large, gives the loop detector a chance to run its model
    /// check, streams one model response and executes the tool calls it
    /// requested. The loop ends on a text-only answer, a detected loop,
    /// cancellation or the iteration limit. Only model backend failures
    /// are returned as errors.
    pub async fn run_turn(
        &mut self,
        user_text: impl Into<String>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, Error> {
        let prompt_id = Uuid::new_v4().to_string();
        self.detector.reset(prompt_id.clone());
        self.history.push(Content::user_text(user_text));

        info!(
            prompt_id = %prompt_id,
            turns = self.history.len(),
            "Processing prompt"
        );

        let mut iterations = 0usize;
        let mut tool_calls_made = 0usize;
        let mut usage: Option<Usage> = None;
        let mut text = String::new();

        let stop = loop {
            if cancel.is_cancelled() {
                break TurnStop::Cancelled;
            }
            if iterations >= self.max_iterations as usize {
                warn!(
                    prompt_id = %prompt_id,
                    iterations,
                    "Max turn iterations reached"
                );
                break TurnStop::MaxIterations;
            }
            iterations += 1;
            debug!(prompt_id = %prompt_id, iteration = iterations, "Turn loop iteration");

            self.reconcile_history();
            self.maybe_compress(cancel).await;

            if self.detector.turn_started(&self.history, cancel).await {
                break self.loop_stop();
            }

            let response = match self.stream_response(cancel).await {
                Ok(response) => response,
                Err(ModelError::Cancelled) => break TurnStop::Cancelled,
                Err(e) => {
                    warn!(prompt_id = %prompt_id, error = %e, "Model request failed");
                    self.event_bus.publish(DomainEvent::ErrorOccurred {
                        context: "model_request".into(),
                        error_message: e.to_string(),
                        timestamp: Utc::now(),
                    });
                    self.emit(TurnEvent::Error {
                        message: e.to_string(),
                    });
                    return Err(e.into());
                }
            };

            if let Some(u) = response.usage {
                add_usage(&mut usage, u);
            }
            if let Some(content) = response.to_content() {
                self.history.push(content);
            }

            if response.cancelled {
                break TurnStop::Cancelled;
            }
            if response.loop_detected {
                break self.loop_stop();
            }
            if response.calls.is_empty() {
                text = response.text;
                break TurnStop::Completed;
            }

            tool_calls_made += response.calls.len();
            let outcome = self.scheduler.schedule(response.calls, cancel).await;
            self.report_batch(&outcome);
            if let Some(content) = outcome.into_content() {
                self.history.push(content);
            }
        };

        info!(
            prompt_id = %prompt_id,
            iterations,
            tool_calls_made,
            stop = ?stop,
            "Prompt finished"
        );
        self.emit(TurnEvent::Done {
            prompt_id: prompt_id.clone(),
            usage,
            iterations,
            tool_calls_made,
            stop,
        });

        Ok(TurnOutcome {
            prompt_id,
            stop,
            text,
            iterations,
            tool_calls_made,
            usage,
        })
    }

    /// Compress the history now, regardless of its size.
    pub async fn compress_now(&mut self, cancel: &CancellationToken) -> CompressionResult {
        let result = self
            .compressor
            .compress(&self.history, &self.model, self.client.as_ref(), cancel)
            .await;
        if result.success() {
            self.auto_compress = true;
        }
        self.apply_compression(&result);
        result
    }

    fn reconcile_history(&mut self) {
        let Reconciled { history, report } = reconcile(&self.history);
        if report.is_clean() {
            return;
        }
        warn!(
            synthesized = report.synthesized.len(),
            orphaned = report.orphaned.len(),
            duplicates = report.duplicates.len(),
            relocated = report.relocated,
            realigned = report.realigned,
            reordered_turns = report.reordered_turns,
            "Repaired call/response pairing in history"
        );
        self.event_bus.publish(DomainEvent::HistoryReconciled {
            synthesized: report.synthesized.len(),
            dropped: report.dropped(),
            timestamp: Utc::now(),
        });
        self.history = history;
    }

    async fn maybe_compress(&mut self, cancel: &CancellationToken) {
        if !self.auto_compress {
            return;
        }
        let decision = self
            .compressor
            .should_compress(&self.history, &self.model, self.client.as_ref(), false)
            .await;
        if !decision.should_compress {
            return;
        }
        let result = self
            .compressor
            .compress(&self.history, &self.model, self.client.as_ref(), cancel)
            .await;
        self.apply_compression(&result);
    }

    fn apply_compression(&mut self, result: &CompressionResult) {
        match (&result.status, &result.new_history) {
            (CompressionStatus::Compressed, Some(history)) => {
                self.history = history.clone();
                self.emit(TurnEvent::Compressed {
                    original_tokens: result.original_token_count,
                    new_tokens: result.new_token_count,
                });
            }
            (CompressionStatus::InflatedTokenCount, _) => {
                warn!("Automatic compression disabled until compression is requested");
                self.auto_compress = false;
            }
            (status, _) => {
                debug!(status = ?status, "Compression skipped, keeping history");
            }
        }
    }

    async fn stream_response(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<StreamedResponse, ModelError> {
        let mut request = ModelRequest::new(self.model.clone(), self.history.clone())
            .with_tools(self.scheduler.registry().definitions());
        if let Some(instruction) = &self.system_instruction {
            request = request.with_system_instruction(instruction.clone());
        }

        let mut stream = self
            .client
            .generate_content_stream(request, cancel.clone())
            .await?;
        let mut response = StreamedResponse::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                event = stream.recv() => Some(event),
            };
            let Some(event) = next else {
                response.cancelled = true;
                break;
            };
            let Some(event) = event else {
                break;
            };
            if self.detector.observe(&event) {
                response.loop_detected = true;
                break;
            }

            match event {
                ModelStreamEvent::Content(chunk) => {
                    self.emit(TurnEvent::Chunk {
                        content: chunk.clone(),
                    });
                    response.text.push_str(&chunk);
                }
                ModelStreamEvent::ToolCallRequest(mut call) => {
                    if call.call_id.is_empty() {
                        call.call_id = format!("{}-{}", call.name, Uuid::new_v4());
                    }
                    self.emit(TurnEvent::ToolCall {
                        id: call.call_id.clone(),
                        name: call.name.clone(),
                        input: call.args.clone(),
                    });
                    response.calls.push(call);
                }
                ModelStreamEvent::Usage(u) => response.usage = Some(u),
                ModelStreamEvent::Error(e) => return Err(e),
                ModelStreamEvent::Finished(reason) => {
                    debug!(reason = ?reason, "Model response finished");
                    break;
                }
            }
        }
        // Dropping the receiver tells the backend to stop producing.
        drop(stream);
        Ok(response)
    }

    fn report_batch(&self, outcome: &BatchOutcome) {
        for call in &outcome.calls {
            let output = match (&call.output, &call.error) {
                (Some(output), _) => output.output.clone(),
                (None, Some(error)) => error.to_string(),
                (None, None) => String::new(),
            };
            self.emit(TurnEvent::ToolResult {
                id: call.request.call_id.clone(),
                name: call.request.name.clone(),
                output,
                status: call.status,
                success: call.succeeded(),
            });
        }
    }

    fn loop_stop(&self) -> TurnStop {
        match self.detector.detected() {
            Some(kind) => {
                self.emit(TurnEvent::LoopDetected {
                    kind,
                    message: kind.describe().to_string(),
                });
                TurnStop::LoopDetected { kind }
            }
            None => TurnStop::Completed,
        }
    }
}

fn add_usage(total: &mut Option<Usage>, usage: Usage) {
    let total = total.get_or_insert_with(Usage::default);
    total.prompt_tokens += usage.prompt_tokens;
    total.completion_tokens += usage.completion_tokens;
    total.total_tokens += usage.total_tokens;
}
