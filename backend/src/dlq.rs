//! Dead-letter queue: captures `FusedRecord`s whose history
//! write failed, retries them with a bounded count, and escalates
//! permanently-failing records to a terminal `dead` queue an operator can
//! inspect. Grounded in the teacher's append-only `state.json` load/save
//! idiom (`tokio::fs::read_to_string`/`write`), reused here for a
//! single-reader durable queue instead of a single snapshot file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{info, warn};

use fusion_types::FusedRecord;

use crate::persistence::PersistenceLayer;

/// A record that failed to persist, plus enough bookkeeping to retry and
/// eventually give up on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub record: FusedRecord,
    pub reason: String,
    pub enqueued_at: i64,
    pub retry_count: u32,
}

struct Inner {
    pending: Vec<DeadLetterEntry>,
    dead: Vec<DeadLetterEntry>,
}

/// Invariant: every entry here was already published on the bus
/// before landing in the DLQ — subscribers saw the live update even though
/// its history write is still pending.
pub struct DeadLetterQueue {
    inner: Mutex<Inner>,
    pending_path: PathBuf,
    dead_path: PathBuf,
}

impl DeadLetterQueue {
    /// Load any entries left over from a previous run (from the
    /// append-only JSON-lines file) so a restart doesn't silently lose
    /// queued retries.
    pub async fn load(pending_path: PathBuf, dead_path: PathBuf) -> Self {
        let pending = read_entries(&pending_path).await;
        let dead = read_entries(&dead_path).await;
        if !pending.is_empty() || !dead.is_empty() {
            info!(pending = pending.len(), dead = dead.len(), "DLQ restored from disk");
        }
        Self {
            inner: Mutex::new(Inner { pending, dead }),
            pending_path,
            dead_path,
        }
    }

    pub async fn enqueue(&self, record: FusedRecord, reason: String, now_ms: i64) {
        let entry = DeadLetterEntry {
            record,
            reason,
            enqueued_at: now_ms,
            retry_count: 0,
        };
        warn!(key = %entry.record.key(), reason = %entry.reason, "persist failed, enqueuing to DLQ");
        let mut inner = self.inner.lock().await;
        inner.pending.push(entry);
        self.rewrite_pending(&inner.pending).await;
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.pending.len()
    }

    pub async fn dead_count(&self) -> usize {
        self.inner.lock().await.dead.len()
    }

    /// Pop up to `batch_size` pending entries, hand each back to
    /// persistence. Success drops the entry; failure increments
    /// `retry_count` and either stays pending or, at `max_retries`, moves
    /// to the terminal dead queue. Returns the entries that were escalated
    /// to dead on this sweep, for callers that want to alert on them.
    pub async fn retry_sweep(
        &self,
        persistence: &PersistenceLayer,
        max_retries: u32,
        batch_size: usize,
    ) -> Vec<DeadLetterEntry> {
        let mut inner = self.inner.lock().await;
        if inner.pending.is_empty() {
            return Vec::new();
        }

        let take = batch_size.min(inner.pending.len());
        let batch: Vec<DeadLetterEntry> = inner.pending.drain(..take).collect();
        let mut still_pending = Vec::new();
        let mut newly_dead = Vec::new();
        let mut recovered = 0u32;

        for entry in batch {
            let result = persistence.flush_history(std::slice::from_ref(&entry.record)).await;
            match apply_retry_result(entry, result, max_retries) {
                RetryOutcome::Recovered => recovered += 1,
                RetryOutcome::StillPending(e) => still_pending.push(e),
                RetryOutcome::Dead(e) => newly_dead.push(e),
            }
        }

        inner.pending.extend(still_pending);
        inner.dead.extend(newly_dead.clone());

        if recovered > 0 {
            info!(recovered, "DLQ retry sweep recovered entries");
        }
        self.rewrite_pending(&inner.pending).await;
        self.rewrite_dead(&inner.dead).await;
        newly_dead
    }

    /// Operator `peek` of the terminal dead queue. No HTTP endpoint wraps
    /// this yet; it's the method an admin route would call.
    pub async fn peek_dead(&self) -> Vec<DeadLetterEntry> {
        self.inner.lock().await.dead.clone()
    }

    /// Empties the dead queue, returning how many entries were cleared.
    pub async fn clear_dead(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let n = inner.dead.len();
        inner.dead.clear();
        self.rewrite_dead(&inner.dead).await;
        n
    }

    /// Moves every dead entry back to pending with its retry count reset,
    /// giving it a fresh run of attempts.
    pub async fn requeue_dead(&self) -> usize {
        let mut inner = self.inner.lock().await;
        let n = inner.dead.len();
        for mut entry in inner.dead.drain(..).collect::<Vec<_>>() {
            entry.retry_count = 0;
            inner.pending.push(entry);
        }
        self.rewrite_pending(&inner.pending).await;
        self.rewrite_dead(&inner.dead).await;
        n
    }

    async fn rewrite_pending(&self, entries: &[DeadLetterEntry]) {
        if let Err(e) = write_entries(&self.pending_path, entries).await {
            warn!(error = %e, "failed to persist DLQ pending file");
        }
    }

    async fn rewrite_dead(&self, entries: &[DeadLetterEntry]) {
        if let Err(e) = write_entries(&self.dead_path, entries).await {
            warn!(error = %e, "failed to persist DLQ dead file");
        }
    }
}

#[derive(Debug)]
enum RetryOutcome {
    Recovered,
    StillPending(DeadLetterEntry),
    Dead(DeadLetterEntry),
}

/// Pure decision step of one retry attempt: bump `retry_count` on failure
/// and escalate to the dead queue once it reaches `max_retries`. Split out
/// from `retry_sweep` so the escalation rule can be tested without a real
/// `PersistenceLayer`.
fn apply_retry_result(
    mut entry: DeadLetterEntry,
    result: Result<(), crate::errors::PersistError>,
    max_retries: u32,
) -> RetryOutcome {
    match result {
        Ok(()) => RetryOutcome::Recovered,
        Err(e) => {
            entry.retry_count += 1;
            if entry.retry_count >= max_retries {
                warn!(key = %entry.record.key(), retries = entry.retry_count, "DLQ entry exhausted retries, moving to dead queue");
                RetryOutcome::Dead(entry)
            } else {
                warn!(key = %entry.record.key(), retries = entry.retry_count, error = %e, "DLQ retry failed");
                RetryOutcome::StillPending(entry)
            }
        }
    }
}

async fn read_entries(path: &PathBuf) -> Vec<DeadLetterEntry> {
    let Ok(file) = File::open(path).await else {
        return Vec::new();
    };
    let mut lines = BufReader::new(file).lines();
    let mut entries = Vec::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<DeadLetterEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(error = %e, path = %path.display(), "skipping unreadable DLQ line"),
        }
    }
    entries
}

async fn write_entries(path: &PathBuf, entries: &[DeadLetterEntry]) -> std::io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .await?;
    for entry in entries {
        let line = serde_json::to_string(entry)?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
    }
    file.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_types::{EntityKey, NormMsg, Source};

    fn record() -> FusedRecord {
        FusedRecord {
            msg: NormMsg {
                key: EntityKey::vessel_from_mmsi("367000001").unwrap(),
                source: Source::AisVendorWs,
                source_weight: 0.9,
                ts: 1_700_000_000_000,
                ingest_ts: 1_700_000_000_000,
                lat: 1.0,
                lon: 1.0,
                speed: None,
                course: None,
                heading: None,
                altitude: None,
                status: None,
                name: None,
                callsign: None,
                sane: true,
            },
            score: 0.9,
            published_at: 1_700_000_000_000,
        }
    }

    #[tokio::test]
    async fn enqueue_then_peek_roundtrips_through_disk() {
        let dir = std::env::temp_dir().join(format!("dlq-test-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let pending_path = dir.join("pending.jsonl");
        let dead_path = dir.join("dead.jsonl");

        let dlq = DeadLetterQueue::load(pending_path.clone(), dead_path.clone()).await;
        dlq.enqueue(record(), "history unavailable".to_string(), 1_700_000_000_000).await;
        assert_eq!(dlq.pending_count().await, 1);

        let reloaded = DeadLetterQueue::load(pending_path, dead_path).await;
        assert_eq!(reloaded.pending_count().await, 1);
    }

    #[tokio::test]
    async fn clear_dead_empties_the_terminal_queue_and_reports_count() {
        let dir = std::env::temp_dir().join(format!("dlq-test-clear-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let dlq = DeadLetterQueue::load(dir.join("pending.jsonl"), dir.join("dead.jsonl")).await;

        {
            let mut inner = dlq.inner.lock().await;
            inner.dead.push(DeadLetterEntry {
                record: record(),
                reason: "exhausted".to_string(),
                enqueued_at: 0,
                retry_count: 5,
            });
        }

        let cleared = dlq.clear_dead().await;
        assert_eq!(cleared, 1);
        assert_eq!(dlq.dead_count().await, 0);
    }

    fn entry_with_retries(retry_count: u32) -> DeadLetterEntry {
        DeadLetterEntry {
            record: record(),
            reason: "history unavailable".to_string(),
            enqueued_at: 0,
            retry_count,
        }
    }

    #[test]
    fn failed_retry_increments_count_and_stays_pending_below_max() {
        let entry = entry_with_retries(1);
        let err = Err(crate::errors::PersistError::HistoryTransient("connection reset".to_string()));
        match apply_retry_result(entry, err, 3) {
            RetryOutcome::StillPending(e) => assert_eq!(e.retry_count, 2),
            other => panic!("expected StillPending, got {other:?}"),
        }
    }

    #[test]
    fn failed_retry_escalates_to_dead_at_max_retries() {
        let entry = entry_with_retries(2);
        let err = Err(crate::errors::PersistError::HistoryTransient("connection reset".to_string()));
        match apply_retry_result(entry, err, 3) {
            RetryOutcome::Dead(e) => assert_eq!(e.retry_count, 3),
            other => panic!("expected Dead, got {other:?}"),
        }
    }

    #[test]
    fn successful_retry_recovers() {
        let entry = entry_with_retries(1);
        match apply_retry_result(entry, Ok(()), 3) {
            RetryOutcome::Recovered => {}
            other => panic!("expected Recovered, got {other:?}"),
        }
    }
}
