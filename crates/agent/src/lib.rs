//! The turn execution core of Turnwright.
//!
//! One user prompt runs as a sequence of model round-trips driven by
//! [`TurnLoop`]:
//!
//! 1. **Reconcile** the history so every function call has exactly one
//!    response
//! 2. **Compress** the history when it nears the model's token limit
//! 3. **Check for loops** (model-judged, on a schedule)
//! 4. **Stream** the model response, feeding every event to the loop detector
//! 5. **Schedule** the requested tool calls as one batch and fold their
//!    responses back into the history
//!
//! The loop ends on a text-only answer, a detected loop, cancellation or
//! the iteration limit.

pub mod compression;
pub mod loop_detection;
pub mod reconcile;
pub mod scheduler;
pub mod stream_event;
pub mod turn;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use compression::{
    COMPRESSION_ACK, ChatCompressor, CompressionDecision, CompressionError, CompressionResult,
    CompressionStatus,
};
pub use loop_detection::LoopDetector;
pub use reconcile::{PartRef, ReconcileReport, Reconciled, reconcile};
pub use scheduler::{BatchOutcome, CompletedToolCall, ToolScheduler};
pub use stream_event::{TurnEvent, TurnStop};
pub use turn::{TurnLoop, TurnOutcome};
