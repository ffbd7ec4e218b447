//! Library target for the fusion backend binary: every module is public so
//! `backend/tests/*.rs` integration tests exercise the same code the
//! `fusion-backend` binary runs, rather than a parallel copy of it.

pub mod adapters;
pub mod backpressure;
pub mod broadcast_gateway;
pub mod config;
pub mod dlq;
pub mod errors;
pub mod fusion;
pub mod geo;
pub mod normalizer;
pub mod persistence;
pub mod pubsub;
pub mod raw;
pub mod status;

use std::time::{SystemTime, UNIX_EPOCH};

/// Current UTC time in milliseconds. Shared by `main` and by tests that
/// need "now" without depending on wall-clock-sensitive sleeps.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
