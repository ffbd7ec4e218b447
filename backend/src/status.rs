//! Operator status snapshot: `{adapters, fusion, dlq}`. The only
//! HTTP surface this service exposes — a read-only mirror, not the
//! REST/auth administration surface this service deliberately omits.

use std::sync::Arc;

use serde::Serialize;

use crate::adapters::common::AdapterStatus;
use crate::dlq::DeadLetterQueue;
use crate::fusion::FusionEngine;

#[derive(Debug, Serialize)]
pub struct FusionStatus {
    pub batches: u64,
    pub normalized: u64,
    pub published: u64,
    pub window_keys: usize,
}

#[derive(Debug, Serialize)]
pub struct DlqStatus {
    pub pending: usize,
    pub dead: usize,
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub adapters: Vec<AdapterStatus>,
    pub fusion: FusionStatus,
    pub dlq: DlqStatus,
}

/// Process-wide counters the orchestrator increments; read-mostly and
/// cheap to snapshot: written only from the ingest/decide loop, read only
/// from the status route.
#[derive(Default)]
pub struct FusionCounters {
    pub batches: std::sync::atomic::AtomicU64,
    pub normalized: std::sync::atomic::AtomicU64,
    pub published: std::sync::atomic::AtomicU64,
}

pub struct StatusSource {
    pub adapters: Vec<Arc<dyn crate::adapters::common::SourceAdapter>>,
    pub counters: Arc<FusionCounters>,
    pub fusion: Arc<FusionEngine>,
    pub dlq: Arc<DeadLetterQueue>,
}

pub async fn snapshot(source: &StatusSource) -> StatusSnapshot {
    use std::sync::atomic::Ordering;

    let adapters = source.adapters.iter().map(|a| a.status()).collect();
    let fusion = FusionStatus {
        batches: source.counters.batches.load(Ordering::Relaxed),
        normalized: source.counters.normalized.load(Ordering::Relaxed),
        published: source.counters.published.load(Ordering::Relaxed),
        window_keys: source.fusion.window_key_count().await,
    };
    let dlq = DlqStatus {
        pending: source.dlq.pending_count().await,
        dead: source.dlq.dead_count().await,
    };

    StatusSnapshot { adapters, fusion, dlq }
}
