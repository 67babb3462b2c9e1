//! Payload truncation
//!
//! Oversized payloads are shrunk by a fixed chain of strategies, applied in
//! order until the serialized size fits the ceiling or the chain runs out.
//! Size is always re-measured from the full JSON encoding after each step.

mod engine;
mod strategy;

pub use engine::{TruncationEngine, TruncationReport};
pub use strategy::{TruncationStrategy, MINIMAL_TEXT_LIMIT, TRUNCATION_MARKER};
