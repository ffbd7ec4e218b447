//! The opaque per-source payload adapters hand to the normalizer as a
//! `RawMsg`. Field names and shapes vary by source; the normalizer is the
//! only place that knows how to read them.

use fusion_types::Source;
use serde_json::Value;

#[derive(Debug, Clone)]
pub struct RawMsg {
    pub source: Source,
    /// Milliseconds, UTC, when the adapter read this record off the wire.
    pub received_at: i64,
    pub payload: Value,
}
