//! Repetition tracking over streamed model text.

use rustc_hash::{FxHashMap, FxHasher};
use std::hash::{Hash, Hasher};
use turnwright_config::LoopDetectionConfig;

const CODE_FENCE: &str = "```";

/// Phrases that legitimately recur in long structured answers.
const BOILERPLATE: &[&str] = &[
    "for example",
    "let me know",
    "note:",
    "here is",
    "here's",
    "step ",
    "you can",
];

/// Sliding-window repetition detector over a bounded character buffer.
#[derive(Debug)]
pub struct ContentTracker {
    chunk_size: usize,
    threshold: usize,
    max_history: usize,
    spacing_factor: f64,
    buffer: Vec<char>,
    /// Start of the next window to examine.
    cursor: usize,
    /// Window start positions, keyed by window hash.
    occurrences: FxHashMap<u64, Vec<usize>>,
    in_code_block: bool,
}

impl ContentTracker {
    pub fn new(config: &LoopDetectionConfig) -> Self {
        Self {
            chunk_size: config.content_chunk_size.max(1),
            threshold: config.content_loop_threshold.max(2),
            max_history: config.content_max_history.max(config.content_chunk_size),
            spacing_factor: config.content_spacing_factor,
            buffer: Vec::new(),
            cursor: 0,
            occurrences: FxHashMap::default(),
            in_code_block: false,
        }
    }

    /// Forget everything seen so far, including an unclosed code fence.
    pub fn reset(&mut self) {
        self.clear_windows();
        self.in_code_block = false;
    }

    fn clear_windows(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
        self.occurrences.clear();
    }

    /// Feed streamed text. Returns `true` when a repetition loop is found.
    pub fn push(&mut self, text: &str) -> bool {
        let fences = text.matches(CODE_FENCE).count();
        if fences > 0 {
            self.clear_windows();
        }
        let was_in_code_block = self.in_code_block;
        if fences % 2 == 1 {
            self.in_code_block = !self.in_code_block;
        }
        if was_in_code_block || self.in_code_block || fences > 0 {
            return false;
        }

        self.buffer.extend(text.chars());
        self.truncate();

        while self.cursor + self.chunk_size <= self.buffer.len() {
            let start = self.cursor;
            self.cursor += 1;
            if self.record(start) {
                return true;
            }
        }
        false
    }

    fn truncate(&mut self) {
        if self.buffer.len() <= self.max_history {
            return;
        }
        let excess = self.buffer.len() - self.max_history;
        self.buffer.drain(..excess);
        self.cursor = self.cursor.saturating_sub(excess);
        self.occurrences.retain(|_, positions| {
            positions.retain(|&p| p >= excess);
            for p in positions.iter_mut() {
                *p -= excess;
            }
            !positions.is_empty()
        });
    }

    fn window(&self, start: usize) -> &[char] {
        &self.buffer[start..start + self.chunk_size]
    }

    /// Record the window at `start`; `true` if it completes a loop.
    fn record(&mut self, start: usize) -> bool {
        let window = self.window(start);
        if !window.iter().any(|c| c.is_alphanumeric()) {
            return false;
        }

        let mut hasher = FxHasher::default();
        window.hash(&mut hasher);
        let key = hasher.finish();

        let verified = match self.occurrences.get(&key).and_then(|p| p.last()) {
            Some(&previous) => self.window(previous) == window,
            None => true,
        };
        if !verified {
            // Hash collision with different text.
            return false;
        }

        let positions = self.occurrences.entry(key).or_default();
        positions.push(start);
        if positions.len() < self.threshold {
            return false;
        }

        let recent = &positions[positions.len() - self.threshold..];
        let span = recent[recent.len() - 1] - recent[0];
        let average = span as f64 / (self.threshold - 1) as f64;
        let allowed = if self.looks_structural(start) {
            self.chunk_size as f64
        } else {
            self.chunk_size as f64 * self.spacing_factor
        };
        average <= allowed
    }

    /// Whether the window at `start` sits in naturally repeating structure:
    /// list items, table rows, headings, quotes, rules or stock phrases.
    /// The line the window starts in counts, not just the window itself.
    fn looks_structural(&self, start: usize) -> bool {
        let window: String = self.window(start).iter().collect();
        if contains_boilerplate(&window) {
            return true;
        }
        let line_start = self.buffer[..start]
            .iter()
            .rposition(|&c| c == '\n')
            .map_or(0, |p| p + 1);
        let context: String = self.buffer[line_start..start + self.chunk_size].iter().collect();
        context.lines().any(is_structural_line)
    }
}

fn contains_boilerplate(text: &str) -> bool {
    let lowered = text.to_lowercase();
    BOILERPLATE.iter().any(|p| lowered.contains(p))
}

fn is_structural_line(line: &str) -> bool {
    let line = line.trim_start();
    let numbered = line
        .split_once(". ")
        .is_some_and(|(n, _)| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
    numbered
        || line.starts_with('|')
        || line.starts_with("- ")
        || line.starts_with("* ")
        || line.starts_with("+ ")
        || line.starts_with('#')
        || line.starts_with('>')
        || line.starts_with("---")
}
