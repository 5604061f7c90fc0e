//! History compression.
//!
//! Keeps the conversation inside the model's context window by replacing
//! the middle of the history with a model-written state snapshot:
//!
//! ```text
//! [head: environment turns] [compressed middle ...] [tail: recent turns]
//!                                  │
//!                                  ▼
//! [head] [user: <snapshot>] [model: acknowledgement] [tail]
//! ```
//!
//! The head is kept verbatim, the tail is roughly `preserve_fraction` of the
//! rest, and both cut points sit on safe boundaries so no call is separated
//! from its response.

pub mod split;
pub mod token;

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use turnwright_config::{CompressionConfig, ModelLimitsConfig};
use turnwright_core::content::Content;
use turnwright_core::error::ModelError;
use turnwright_core::event::{DomainEvent, EventBus};
use turnwright_core::model::{ModelClient, ModelRequest};

pub use split::{find_split_point, safe_boundaries};
pub use token::{estimate_content_tokens, estimate_history_tokens, estimate_tokens};

/// The model's reply that closes the digest exchange.
pub const COMPRESSION_ACK: &str = "Got it. Thanks for the additional context!";

const COMPRESSION_PROMPT: &str = r#"You are the component that condenses an assistant's working history into a structured snapshot.

When the conversation grows too long, everything before this point is replaced by your snapshot. The assistant will only have the snapshot, so it must capture every goal, decision, file and unresolved problem that still matters.

Think through the whole history first. Then produce the final <state_snapshot> XML object and nothing else. Be dense: leave out pleasantries and anything irrelevant to future work.

<state_snapshot>
    <overall_goal>
        <!-- One sentence describing the user's high-level objective. -->
    </overall_goal>
    <key_knowledge>
        <!-- Facts, conventions and constraints the assistant must remember. Bullet points. -->
    </key_knowledge>
    <file_system_state>
        <!-- Files created, read, modified or deleted, with the relevant findings. -->
    </file_system_state>
    <recent_actions>
        <!-- The last significant actions and their outcomes. -->
    </recent_actions>
    <current_plan>
        <!-- The step-by-step plan, marking steps [DONE], [IN PROGRESS] or [TODO]. -->
    </current_plan>
</state_snapshot>"#;

const SNAPSHOT_REQUEST: &str = "First, reason in your scratchpad. Then, generate the <state_snapshot>.";

#[derive(Debug, Clone, Error)]
pub enum CompressionError {
    #[error("Not enough history to compress: {turns} turns after the split, need {required}")]
    InsufficientHistory { turns: usize, required: usize },

    #[error("Nothing to compress before the preserved tail")]
    NothingToCompress,

    #[error("Token counting failed: {0}")]
    TokenCount(ModelError),

    #[error("Summarization request failed: {0}")]
    Summarizer(ModelError),

    #[error("Summarization returned no text")]
    EmptySummary,

    #[error("Compression would grow the history from {original} to {new} tokens")]
    InflatedTokenCount { original: u64, new: u64 },
}

/// Outcome category of a compression attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStatus {
    Compressed,
    NothingToCompress,
    InsufficientHistory,
    SummarizerFailed,
    InflatedTokenCount,
}

impl CompressionError {
    pub fn status(&self) -> CompressionStatus {
        match self {
            Self::InsufficientHistory { .. } => CompressionStatus::InsufficientHistory,
            Self::NothingToCompress => CompressionStatus::NothingToCompress,
            Self::TokenCount(_) | Self::Summarizer(_) | Self::EmptySummary => {
                CompressionStatus::SummarizerFailed
            }
            Self::InflatedTokenCount { .. } => CompressionStatus::InflatedTokenCount,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompressionResult {
    pub status: CompressionStatus,
    pub summary: Option<String>,
    pub new_history: Option<Vec<Content>>,
    pub original_token_count: u64,
    pub new_token_count: u64,
    pub error: Option<CompressionError>,
}

impl CompressionResult {
    pub fn success(&self) -> bool {
        self.status == CompressionStatus::Compressed
    }

    fn failed(error: CompressionError, original_token_count: u64) -> Self {
        Self {
            status: error.status(),
            summary: None,
            new_history: None,
            original_token_count,
            new_token_count: original_token_count,
            error: Some(error),
        }
    }
}

/// Answer of [`ChatCompressor::should_compress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionDecision {
    pub should_compress: bool,
    /// `None` when counting failed.
    pub token_count: Option<u64>,
}

/// Decides when to compress and performs the compression.
pub struct ChatCompressor {
    config: CompressionConfig,
    limits: ModelLimitsConfig,
    event_bus: Arc<EventBus>,
}

impl ChatCompressor {
    pub fn new(config: CompressionConfig, limits: ModelLimitsConfig, event_bus: Arc<EventBus>) -> Self {
        Self {
            config,
            limits,
            event_bus,
        }
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }

    pub fn token_limit(&self, model: &str) -> u64 {
        self.limits.token_limit(model)
    }

    async fn count(&self, counter: &dyn ModelClient, model: &str, history: &[Content]) -> Result<u64, ModelError> {
        counter.count_tokens(model, history).await
    }

    /// Whether `history` has grown past the configured fraction of the
    /// model's limit. Counting failures mean "no" unless `force` is set.
    pub async fn should_compress(
        &self,
        history: &[Content],
        model: &str,
        counter: &dyn ModelClient,
        force: bool,
    ) -> CompressionDecision {
        if history.is_empty() {
            return CompressionDecision {
                should_compress: false,
                token_count: Some(0),
            };
        }

        let token_count = match self.count(counter, model, history).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "Token counting failed, skipping compression check");
                return CompressionDecision {
                    should_compress: force,
                    token_count: None,
                };
            }
        };

        let limit = self.token_limit(model).max(1);
        let ratio = token_count as f64 / limit as f64;
        let should_compress = force || ratio >= self.config.threshold;
        debug!(token_count, limit, ratio, should_compress, "Compression check");
        CompressionDecision {
            should_compress,
            token_count: Some(token_count),
        }
    }

    /// Compress `history`. Failures are reported in the result; the caller
    /// keeps its uncompressed history.
    pub async fn compress(
        &self,
        history: &[Content],
        model: &str,
        client: &dyn ModelClient,
        cancel: &CancellationToken,
    ) -> CompressionResult {
        let original_token_count = match self.count(client, model, history).await {
            Ok(count) => count,
            Err(e) => {
                debug!(error = %e, "Falling back to estimated token count");
                estimate_history_tokens(history)
            }
        };

        let safe = safe_boundaries(history);
        let head_end = split::snap_forward(&safe, self.config.preserve_initial_turns.min(history.len()));
        let split = find_split_point(history, head_end, self.config.preserve_fraction);

        if split <= head_end {
            return CompressionResult::failed(CompressionError::NothingToCompress, original_token_count);
        }
        let tail_turns = history.len() - split;
        if tail_turns < self.config.min_tail_turns {
            return CompressionResult::failed(
                CompressionError::InsufficientHistory {
                    turns: tail_turns,
                    required: self.config.min_tail_turns,
                },
                original_token_count,
            );
        }

        let mut contents = history[head_end..split].to_vec();
        contents.push(Content::user_text(SNAPSHOT_REQUEST));
        let request = ModelRequest::new(model, contents).with_system_instruction(COMPRESSION_PROMPT);

        let summary = match client.generate_content(request, cancel.clone()).await {
            Ok(response) => response.text().trim().to_string(),
            Err(e) => {
                warn!(error = %e, "History summarization failed");
                return CompressionResult::failed(CompressionError::Summarizer(e), original_token_count);
            }
        };
        if summary.is_empty() {
            warn!("History summarization returned an empty snapshot");
            return CompressionResult::failed(CompressionError::EmptySummary, original_token_count);
        }

        let mut new_history = Vec::with_capacity(head_end + 2 + tail_turns);
        new_history.extend_from_slice(&history[..head_end]);
        new_history.push(Content::user_text(summary.clone()));
        new_history.push(Content::model_text(COMPRESSION_ACK));
        new_history.extend_from_slice(&history[split..]);

        let new_token_count = match self.count(client, model, &new_history).await {
            Ok(count) => count,
            Err(_) => estimate_history_tokens(&new_history),
        };

        if new_token_count > original_token_count {
            warn!(
                original_tokens = original_token_count,
                new_tokens = new_token_count,
                "Compression inflated the history, keeping the original"
            );
            return CompressionResult {
                status: CompressionStatus::InflatedTokenCount,
                summary: Some(summary),
                new_history: None,
                original_token_count,
                new_token_count,
                error: Some(CompressionError::InflatedTokenCount {
                    original: original_token_count,
                    new: new_token_count,
                }),
            };
        }

        info!(
            original_tokens = original_token_count,
            new_tokens = new_token_count,
            compressed_turns = split - head_end,
            "Chat history compressed"
        );
        self.event_bus.publish(DomainEvent::ChatCompressed {
            original_tokens: original_token_count,
            new_tokens: new_token_count,
            timestamp: Utc::now(),
        });

        CompressionResult {
            status: CompressionStatus::Compressed,
            summary: Some(summary),
            new_history: Some(new_history),
            original_token_count,
            new_token_count,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedModel;

    fn alternating(turns: usize, chars: usize) -> Vec<Content> {
        (0..turns)
            .map(|i| {
                if i % 2 == 0 {
                    Content::user_text(format!("{i}{}", "u".repeat(chars)))
                } else {
                    Content::model_text(format!("{i}{}", "m".repeat(chars)))
                }
            })
            .collect()
    }

    fn compressor(config: CompressionConfig, limit: u64) -> (ChatCompressor, Arc<EventBus>) {
        let bus = Arc::new(EventBus::default());
        let limits = ModelLimitsConfig {
            default_token_limit: limit,
            ..Default::default()
        };
        (ChatCompressor::new(config, limits, bus.clone()), bus)
    }

    #[tokio::test]
    async fn triggers_at_threshold() {
        let config = CompressionConfig {
            threshold: 0.8,
            ..Default::default()
        };
        let (c, _) = compressor(config, 1000);
        let history = alternating(8, 10);

        let at = ScriptedModel::new(vec![]).with_token_count(800);
        let decision = c.should_compress(&history, "m", &at, false).await;
        assert!(decision.should_compress);
        assert_eq!(decision.token_count, Some(800));

        let below = ScriptedModel::new(vec![]).with_token_count(799);
        assert!(!c.should_compress(&history, "m", &below, false).await.should_compress);
        assert!(c.should_compress(&history, "m", &below, true).await.should_compress);
    }

    #[tokio::test]
    async fn counting_failure_means_no_compression() {
        let (c, _) = compressor(CompressionConfig::default(), 1000);
        let broken = ScriptedModel::new(vec![]).with_failing_token_count();
        let decision = c.should_compress(&alternating(8, 10), "m", &broken, false).await;
        assert!(!decision.should_compress);
        assert_eq!(decision.token_count, None);
    }

    #[tokio::test]
    async fn compress_keeps_head_digest_and_tail() {
        let (c, bus) = compressor(CompressionConfig::default(), 1000);
        let mut rx = bus.subscribe();
        let history = alternating(8, 100);
        let model = ScriptedModel::new(vec![ScriptedModel::text("<state_snapshot>all</state_snapshot>")])
            .with_token_counts(vec![800, 300]);

        let result = c.compress(&history, "m", &model, &CancellationToken::new()).await;
        assert!(result.success(), "{result:?}");
        let new_history = result.new_history.unwrap();

        assert_eq!(&new_history[..2], &history[..2]);
        assert_eq!(new_history[2], Content::user_text("<state_snapshot>all</state_snapshot>"));
        assert_eq!(new_history[3], Content::model_text(COMPRESSION_ACK));
        assert_eq!(&new_history[4..], &history[6..]);
        assert_eq!(result.original_token_count, 800);
        assert_eq!(result.new_token_count, 300);

        let event = rx.try_recv().unwrap();
        assert!(matches!(event.as_ref(), DomainEvent::ChatCompressed { .. }));

        // The summarizer only saw the middle of the history.
        let request = model.requests().pop().unwrap();
        assert_eq!(request.contents.len(), 5);
        assert_eq!(request.contents[0], history[2]);
    }

    #[tokio::test]
    async fn insufficient_history_fails() {
        let config = CompressionConfig {
            min_tail_turns: 4,
            ..Default::default()
        };
        let (c, _) = compressor(config, 1000);
        let model = ScriptedModel::new(vec![]).with_token_count(900);
        let result = c
            .compress(&alternating(8, 100), "m", &model, &CancellationToken::new())
            .await;
        assert_eq!(result.status, CompressionStatus::InsufficientHistory);
        assert!(result.new_history.is_none());
        assert!(model.requests().is_empty());
    }

    #[tokio::test]
    async fn short_history_has_nothing_to_compress() {
        let (c, _) = compressor(CompressionConfig::default(), 1000);
        let model = ScriptedModel::new(vec![]).with_token_count(900);
        let result = c
            .compress(&alternating(2, 10), "m", &model, &CancellationToken::new())
            .await;
        assert_eq!(result.status, CompressionStatus::NothingToCompress);
    }

    #[tokio::test]
    async fn summarizer_failure_is_reported() {
        let (c, _) = compressor(CompressionConfig::default(), 1000);
        let model = ScriptedModel::new(vec![ScriptedModel::failure(ModelError::Network(
            "down".into(),
        ))])
        .with_token_count(900);
        let result = c
            .compress(&alternating(8, 100), "m", &model, &CancellationToken::new())
            .await;
        assert!(!result.success());
        assert_eq!(result.status, CompressionStatus::SummarizerFailed);
        assert!(matches!(result.error, Some(CompressionError::Summarizer(_))));
    }

    #[tokio::test]
    async fn inflated_result_is_rejected() {
        let (c, _) = compressor(CompressionConfig::default(), 1000);
        let model = ScriptedModel::new(vec![ScriptedModel::text("a very long summary")])
            .with_token_counts(vec![100, 500]);
        let result = c
            .compress(&alternating(8, 100), "m", &model, &CancellationToken::new())
            .await;
        assert_eq!(result.status, CompressionStatus::InflatedTokenCount);
        assert!(result.new_history.is_none());
        assert_eq!(result.new_token_count, 500);
    }
}
