//! Loop detection.
//!
//! Watches one user prompt's worth of model output for three kinds of
//! unproductive behaviour:
//!
//! - the same tool call (name and arguments) issued over and over;
//! - the same text window recurring densely in the streamed answer;
//! - the model itself judging the conversation to be stuck.
//!
//! Streamed events go through [`LoopDetector::observe`]; the periodic
//! model-judged check runs from [`LoopDetector::turn_started`]. Once a loop
//! is found it stays detected until the next [`LoopDetector::reset`].

mod content;
mod semantic;

pub use content::ContentTracker;
pub use semantic::{LoopAssessment, SemanticCheck, recent_turns};

use chrono::Utc;
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use turnwright_config::LoopDetectionConfig;
use turnwright_core::content::Content;
use turnwright_core::event::{DomainEvent, EventBus, LoopKind};
use turnwright_core::model::{ModelClient, ModelStreamEvent};
use turnwright_core::tool::ToolCallRequest;

/// Identity of a tool call for repetition counting.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ToolFingerprint {
    hash: u64,
    key: String,
}

impl ToolFingerprint {
    fn of(request: &ToolCallRequest) -> Self {
        // serde_json maps are sorted, so this is canonical.
        let key = format!("{}:{}", request.name, request.args);
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        Self {
            hash: hasher.finish(),
            key,
        }
    }

    fn same_as(&self, other: &Self) -> bool {
        self.hash == other.hash && self.key == other.key
    }
}

pub struct LoopDetector {
    config: LoopDetectionConfig,
    event_bus: Arc<EventBus>,
    checker: Option<(Arc<dyn ModelClient>, String)>,
    prompt_id: String,
    disabled_for_session: bool,
    detected: Option<LoopKind>,
    last_tool_call: Option<ToolFingerprint>,
    tool_call_repetitions: u32,
    last_monitored_tool: Option<String>,
    monitored_repetitions: u32,
    content: ContentTracker,
    semantic: SemanticCheck,
}

impl LoopDetector {
    pub fn new(config: LoopDetectionConfig, event_bus: Arc<EventBus>) -> Self {
        let content = ContentTracker::new(&config);
        let semantic = SemanticCheck::new(&config);
        Self {
            config,
            event_bus,
            checker: None,
            prompt_id: String::new(),
            disabled_for_session: false,
            detected: None,
            last_tool_call: None,
            tool_call_repetitions: 0,
            last_monitored_tool: None,
            monitored_repetitions: 0,
            content,
            semantic,
        }
    }

    /// Enable the model-judged check using `client` and `model`.
    pub fn with_semantic_check(mut self, client: Arc<dyn ModelClient>, model: impl Into<String>) -> Self {
        self.checker = Some((client, model.into()));
        self
    }

    /// Start tracking a new user prompt.
    pub fn reset(&mut self, prompt_id: impl Into<String>) {
        self.prompt_id = prompt_id.into();
        self.detected = None;
        self.last_tool_call = None;
        self.tool_call_repetitions = 0;
        self.last_monitored_tool = None;
        self.monitored_repetitions = 0;
        self.content.reset();
        self.semantic.reset(&self.config);
    }

    /// Stop detecting loops until the detector is rebuilt.
    pub fn disable_for_session(&mut self) {
        debug!("Loop detection disabled for this session");
        self.disabled_for_session = true;
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_for_session || !self.config.enabled
    }

    /// The loop found for the current prompt, if any.
    pub fn detected(&self) -> Option<LoopKind> {
        self.detected
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    /// Feed one streamed event. Returns `true` when a loop is detected.
    pub fn observe(&mut self, event: &ModelStreamEvent) -> bool {
        if self.is_disabled() {
            return false;
        }
        if self.detected.is_some() {
            return true;
        }

        let found = match event {
            ModelStreamEvent::ToolCallRequest(request) => {
                self.content.reset();
                self.check_tool_call(request)
            }
            ModelStreamEvent::Content(text) => self
                .content
                .push(text)
                .then_some(LoopKind::ChantingIdenticalSentences),
            ModelStreamEvent::Usage(_)
            | ModelStreamEvent::Error(_)
            | ModelStreamEvent::Finished(_) => None,
        };

        match found {
            Some(kind) => {
                self.flag(kind);
                true
            }
            None => false,
        }
    }

    fn check_tool_call(&mut self, request: &ToolCallRequest) -> Option<LoopKind> {
        let fingerprint = ToolFingerprint::of(request);
        match &self.last_tool_call {
            Some(last) if last.same_as(&fingerprint) => self.tool_call_repetitions += 1,
            _ => {
                self.last_tool_call = Some(fingerprint);
                self.tool_call_repetitions = 1;
            }
        }
        if self.tool_call_repetitions >= self.config.tool_call_threshold {
            return Some(LoopKind::ConsecutiveIdenticalToolCalls);
        }

        if self.config.monitored_tools.iter().any(|t| *t == request.name) {
            if self.last_monitored_tool.as_deref() == Some(request.name.as_str()) {
                self.monitored_repetitions += 1;
            } else {
                self.last_monitored_tool = Some(request.name.clone());
                self.monitored_repetitions = 1;
            }
            if self.monitored_repetitions >= self.config.monitored_tool_threshold {
                return Some(LoopKind::RepeatedToolName);
            }
        } else {
            self.last_monitored_tool = None;
            self.monitored_repetitions = 0;
        }
        None
    }

    /// Called at the start of every model turn within the prompt. Runs the
    /// model-judged check when it is due. Failures count as "no loop".
    pub async fn turn_started(&mut self, history: &[Content], cancel: &CancellationToken) -> bool {
        if self.is_disabled() {
            return false;
        }
        if self.detected.is_some() {
            return true;
        }
        if !self.semantic.tick() {
            return false;
        }
        let Some((client, model)) = self.checker.clone() else {
            return false;
        };
        if cancel.is_cancelled() {
            return false;
        }

        if self.semantic.run(history, client.as_ref(), &model, cancel).await {
            self.flag(LoopKind::LlmDetectedLoop);
            return true;
        }
        false
    }

    fn flag(&mut self, kind: LoopKind) {
        if self.detected.is_some() {
            return;
        }
        warn!(prompt_id = %self.prompt_id, kind = ?kind, "Loop detected");
        self.detected = Some(kind);
        self.event_bus.publish(DomainEvent::LoopDetected {
            kind,
            prompt_id: self.prompt_id.clone(),
            timestamp: Utc::now(),
        });
    }
}
