//! Error taxonomy: transient I/O, malformed input, contract violations, and
//! fatal startup errors are distinct types so callers can apply the right
//! policy (retry, drop+count, drop+alert, refuse to start).

use thiserror::Error;

use fusion_types::FusedRecord;

/// Errors the normalizer can report for a single raw record. Never
/// propagated as a `Result::Err` past the normalizer boundary — the
/// orchestrator only ever sees `Reject { reason, source }` counts.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RejectReason {
    #[error("could not derive an entity key: {0}")]
    BadKey(String),
    #[error("lat/lon out of range or unparseable: {0}")]
    BadPosition(String),
    #[error("timestamp unparseable: {0}")]
    BadTimestamp(String),
    #[error("message age exceeds maxAgeMs")]
    StaleAge,
}

/// Errors from the persistence layer. The orchestrator decides DLQ vs.
/// retry based on the variant.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("transient I/O failure writing hot view: {0}")]
    HotViewTransient(String),
    #[error("transient I/O failure writing history: {0}")]
    HistoryTransient(String),
    #[error("contract violation: {0}")]
    ContractViolation(String),
}

/// A `FusedRecord` that failed to persist, carrying enough context for the
/// DLQ to retry it later without re-deriving anything from the bus.
#[derive(Debug, Clone)]
pub struct FailedPersist {
    pub record: FusedRecord,
    pub reason: String,
}

/// Unrecoverable startup/configuration errors. Components that hit these
/// refuse to start rather than limping along.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("failed to connect to history database: {0}")]
    HistoryUnavailable(#[source] sqlx::Error),
    #[error("failed to connect to hot view store: {0}")]
    HotViewUnavailable(#[source] redis::RedisError),
}
