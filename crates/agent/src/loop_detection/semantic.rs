//! Model-judged loop check.
//!
//! After a warm-up number of turns within one prompt, the model is shown
//! the recent history and asked how confident it is that the conversation
//! is stuck. The gap until the next check shrinks as confidence rises.

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use turnwright_config::LoopDetectionConfig;
use turnwright_core::content::{Content, Part, Role};
use turnwright_core::model::{ModelClient, ModelRequest};

const LOOP_CHECK_PROMPT: &str = r#"You are a diagnostic agent that decides whether a conversational AI assistant is stuck in an unproductive state. Review the conversation history above.

An unproductive state is one of:
- Repetitive actions: the same tool calls or responses repeated with no new information.
- Cognitive loop: the assistant cannot decide on a next step, restates its plan, or keeps oscillating between options.

Do not flag legitimate incremental progress, such as editing many files in sequence or running tests after each fix.

Respond with a JSON object and nothing else:
{"reasoning": "<your analysis>", "confidence": <number between 0.0 and 1.0>}"#;

/// What the model reported.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoopAssessment {
    #[serde(default)]
    pub reasoning: String,
    pub confidence: f64,
}

impl LoopAssessment {
    /// Parse the model's answer, tolerating a fenced code block around it.
    pub fn parse(text: &str) -> Option<Self> {
        let trimmed = text.trim();
        let body = trimmed
            .strip_prefix("```json")
            .or_else(|| trimmed.strip_prefix("```"))
            .and_then(|rest| rest.trim_end().strip_suffix("```"))
            .unwrap_or(trimmed);
        let mut assessment: Self = serde_json::from_str(body.trim()).ok()?;
        if !assessment.confidence.is_finite() {
            return None;
        }
        assessment.confidence = assessment.confidence.clamp(0.0, 1.0);
        Some(assessment)
    }
}

/// Turn counting and scheduling for the model-judged check.
#[derive(Debug)]
pub struct SemanticCheck {
    after_turns: u32,
    min_interval: u32,
    max_interval: u32,
    confidence_threshold: f64,
    history_turns: usize,
    turns: u32,
    last_check_turn: u32,
    interval: u32,
}

impl SemanticCheck {
    pub fn new(config: &LoopDetectionConfig) -> Self {
        Self {
            after_turns: config.llm_check_after_turns,
            min_interval: config.llm_min_check_interval,
            max_interval: config.llm_max_check_interval.max(config.llm_min_check_interval),
            confidence_threshold: config.llm_confidence_threshold,
            history_turns: config.llm_history_turns.max(1),
            turns: 0,
            last_check_turn: 0,
            interval: config.llm_check_interval.max(1),
        }
    }

    pub fn reset(&mut self, config: &LoopDetectionConfig) {
        *self = Self::new(config);
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Count a turn; `true` when a check is due now.
    pub fn tick(&mut self) -> bool {
        self.turns += 1;
        if self.turns < self.after_turns {
            return false;
        }
        if self.turns - self.last_check_turn < self.interval {
            return false;
        }
        self.last_check_turn = self.turns;
        true
    }

    /// Recompute the interval from the latest confidence.
    fn reschedule(&mut self, confidence: f64) {
        let span = f64::from(self.max_interval - self.min_interval);
        self.interval = (f64::from(self.min_interval) + span * (1.0 - confidence)).round() as u32;
    }

    /// Ask the model whether the conversation is stuck. Any failure counts
    /// as "not stuck".
    pub async fn run(
        &mut self,
        history: &[Content],
        client: &dyn ModelClient,
        model: &str,
        cancel: &CancellationToken,
    ) -> bool {
        let mut contents = recent_turns(history, self.history_turns);
        let question = Part::text(
            "Is the conversation above stuck? Answer with the JSON object described in your instructions.",
        );
        // Roles must alternate.
        match contents.last_mut() {
            Some(last) if last.role == Role::User => last.parts.push(question),
            _ => contents.push(Content::user(vec![question])),
        }
        let request = ModelRequest::new(model, contents)
            .with_system_instruction(LOOP_CHECK_PROMPT)
            .with_json_response();

        let text = match client.generate_content(request, cancel.clone()).await {
            Ok(response) => response.text(),
            Err(e) => {
                debug!(error = %e, "Loop check request failed, assuming no loop");
                return false;
            }
        };
        let Some(assessment) = LoopAssessment::parse(&text) else {
            warn!("Loop check returned an unparseable answer, assuming no loop");
            return false;
        };

        self.reschedule(assessment.confidence);
        debug!(
            confidence = assessment.confidence,
            next_interval = self.interval,
            "Loop check completed"
        );
        assessment.confidence > self.confidence_threshold
    }
}

/// The last `count` turns, trimmed so the slice starts with a plain user
/// turn and does not end on unanswered calls.
pub fn recent_turns(history: &[Content], count: usize) -> Vec<Content> {
    let start = history.len().saturating_sub(count);
    let mut slice = &history[start..];

    while let Some(first) = slice.first() {
        if first.role == Role::User && !first.has_function_responses() {
            break;
        }
        slice = &slice[1..];
    }
    while let Some(last) = slice.last() {
        if last.role == Role::Model && last.has_function_calls() {
            slice = &slice[..slice.len() - 1];
        } else {
            break;
        }
    }
    slice.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use turnwright_core::content::{FunctionCall, FunctionResponse};

    fn config() -> LoopDetectionConfig {
        LoopDetectionConfig {
            llm_check_after_turns: 3,
            llm_check_interval: 2,
            llm_min_check_interval: 2,
            llm_max_check_interval: 10,
            ..Default::default()
        }
    }

    #[test]
    fn parse_plain_and_fenced_answers() {
        let plain = LoopAssessment::parse(r#"{"reasoning":"r","confidence":0.95}"#).unwrap();
        assert_eq!(plain.confidence, 0.95);

        let fenced =
            LoopAssessment::parse("```json\n{\"reasoning\":\"x\",\"confidence\":0.2}\n```").unwrap();
        assert_eq!(fenced.confidence, 0.2);

        assert!(LoopAssessment::parse("not json").is_none());
        assert_eq!(
            LoopAssessment::parse(r#"{"confidence": 7}"#).unwrap().confidence,
            1.0
        );
    }

    #[test]
    fn ticks_respect_warm_up_and_interval() {
        let mut check = SemanticCheck::new(&config());
        let due: Vec<bool> = (0..8).map(|_| check.tick()).collect();
        // Turns 1..=8: first check at 3, then every 2 turns.
        assert_eq!(due, vec![false, false, true, false, true, false, true, false]);
    }

    #[test]
    fn interval_tracks_confidence() {
        let mut check = SemanticCheck::new(&config());
        check.reschedule(1.0);
        assert_eq!(check.interval(), 2);
        check.reschedule(0.0);
        assert_eq!(check.interval(), 10);
        check.reschedule(0.5);
        assert_eq!(check.interval(), 6);
    }

    #[test]
    fn recent_turns_trims_partial_pairs() {
        let call = Content::model(vec![Part::FunctionCall(FunctionCall::new(
            "read",
            Some("1".into()),
            json!({}),
        ))]);
        let response = Content::user(vec![Part::FunctionResponse(FunctionResponse::output(
            "read",
            Some("1".into()),
            "x",
        ))]);
        let history = vec![
            Content::user_text("a"),
            call.clone(),
            response,
            Content::model_text("b"),
            Content::user_text("c"),
            call,
        ];
        let recent = recent_turns(&history, 4);
        assert_eq!(recent, vec![Content::user_text("c")]);

        let all = recent_turns(&history, 100);
        assert_eq!(all.len(), 5);
        assert_eq!(all[0], Content::user_text("a"));
    }
}
