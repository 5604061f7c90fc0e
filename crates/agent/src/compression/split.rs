//! Choosing where compressed history ends and the preserved tail begins.

use turnwright_core::content::{Content, FunctionCall, FunctionResponse, Role};

fn answers(response: &FunctionResponse, call: &FunctionCall) -> bool {
    match (&response.id, &call.id) {
        (Some(r), Some(c)) => r == c,
        _ => response.name == call.name,
    }
}

/// For every index `i`, whether the history may be cut right before turn
/// `i`: the turn is a user turn that answers nothing and every call issued
/// before it has been answered before it.
pub fn safe_boundaries(history: &[Content]) -> Vec<bool> {
    let mut pending: Vec<&FunctionCall> = Vec::new();
    let mut safe = Vec::with_capacity(history.len() + 1);

    for turn in history {
        safe.push(turn.role == Role::User && !turn.has_function_responses() && pending.is_empty());

        for response in turn.function_responses() {
            if let Some(pos) = pending.iter().position(|call| answers(response, call)) {
                pending.remove(pos);
            }
        }
        pending.extend(turn.function_calls());
    }
    safe.push(pending.is_empty());
    safe
}

/// First safe boundary at or after `from`, or `history.len()` if none.
pub fn snap_forward(safe: &[bool], from: usize) -> usize {
    let end = safe.len().saturating_sub(1);
    (from..end).find(|&i| safe[i]).unwrap_or(end)
}

/// Pick the index where the preserved tail starts.
///
/// Considers turns from `start` on. The tail is sized to roughly
/// `preserve_fraction` of their serialized size, then the index is moved
/// forward to the next safe boundary.
pub fn find_split_point(history: &[Content], start: usize, preserve_fraction: f64) -> usize {
    let start = start.min(history.len());
    let sizes: Vec<usize> = history
        .iter()
        .map(|c| serde_json::to_string(c).map_or(0, |s| s.len()))
        .collect();

    let total: usize = sizes[start..].iter().sum();
    let target = total as f64 * (1.0 - preserve_fraction.clamp(0.0, 1.0));

    let mut best = start;
    let mut best_diff = f64::MAX;
    let mut cumulative = 0usize;
    for (k, size) in sizes.iter().enumerate().skip(start) {
        let diff = (cumulative as f64 - target).abs();
        if diff < best_diff {
            best = k;
            best_diff = diff;
        }
        cumulative += size;
    }
    if (cumulative as f64 - target).abs() < best_diff {
        best = history.len();
    }

    snap_forward(&safe_boundaries(history), best)
}
