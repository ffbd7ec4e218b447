//! Per-entity sliding window, scoring and publish-gating.

pub mod engine;
pub mod scoring;

pub use engine::{DecideResult, FusionEngine, FusionParams};
