//! Producer/consumer liquidation pipeline.
//!
//! The producer sweeps active positions page by page and enqueues a closure
//! request for each unsafe one. Consumer workers pull requests off the shared
//! queue, submit the closing transaction and requeue follow-ups for partial
//! closures and out-of-gas failures. The dedup lock in `coordination` keeps
//! at most one closure per position in flight.

mod consumer;
mod evaluator;
mod producer;
mod request;

pub use consumer::{halve_ceil, next_close_amount, ClosureOutcome, Consumer};
pub use evaluator::{classify, SafetyEvaluator, UnsafeReason, Verdict};
pub use producer::{Producer, SweepStats};
pub use request::{marker_key, ClosureRequest};
