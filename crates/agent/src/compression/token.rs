//! Token estimation utilities.
//!
//! Uses a character-based heuristic: ~4 characters per token. Only used
//! when the model client cannot count tokens itself.

use turnwright_core::content::{Content, Part};

/// Estimate the token count for a string.
///
/// Heuristic: 1 token ≈ 4 characters. Rounds up.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Estimate tokens for one turn including per-turn overhead.
///
/// Each turn costs ~4 tokens for the role and delimiters. Structured parts
/// are estimated from their JSON form.
pub fn estimate_content_tokens(content: &Content) -> u64 {
    let overhead = 4;
    overhead
        + content
            .parts
            .iter()
            .map(|part| match part {
                Part::Text(text) => estimate_tokens(text),
                other => estimate_tokens(&serde_json::to_string(other).unwrap_or_default()),
            })
            .sum::<u64>()
}

/// Estimate tokens for a whole history.
pub fn estimate_history_tokens(history: &[Content]) -> u64 {
    history.iter().map(estimate_content_tokens).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnwright_core::content::FunctionCall;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn four_chars_is_one_token() {
        assert_eq!(estimate_tokens("test"), 1);
    }

    #[test]
    fn five_chars_rounds_up() {
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn content_includes_overhead() {
        // 4 chars -> 1 token + 4 overhead
        assert_eq!(estimate_content_tokens(&Content::user_text("test")), 5);
    }

    #[test]
    fn function_calls_are_counted() {
        let content = Content::model(vec![Part::FunctionCall(FunctionCall::new(
            "shell",
            Some("c1".into()),
            serde_json::json!({"command": "cargo build --release"}),
        ))]);
        assert!(estimate_content_tokens(&content) > 10);
    }

    #[test]
    fn history_sums_turns() {
        let history = vec![Content::user_text("test"), Content::model_text("test")];
        assert_eq!(estimate_history_tokens(&history), 10);
    }
}
