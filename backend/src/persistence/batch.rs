//! Accumulates `FusedRecord`s for the history store and flushes on whichever
//! comes first: `batchSize` records or `batchTimeout` elapsed.
//! A flush is also triggered explicitly on shutdown.

use std::time::Duration;

use fusion_types::FusedRecord;
use tokio::time::Instant;

pub struct BatchAccumulator {
    records: Vec<FusedRecord>,
    batch_size: usize,
    batch_timeout: Duration,
    deadline: Option<Instant>,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize, batch_timeout_ms: u64) -> Self {
        Self {
            records: Vec::with_capacity(batch_size),
            batch_size,
            batch_timeout: Duration::from_millis(batch_timeout_ms),
            deadline: None,
        }
    }

    /// Push a record; returns `true` if the batch is now full and should be
    /// flushed immediately.
    pub fn push(&mut self, rec: FusedRecord) -> bool {
        if self.records.is_empty() {
            self.deadline = Some(Instant::now() + self.batch_timeout);
        }
        self.records.push(rec);
        self.records.len() >= self.batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// The instant this batch should flush even if it never fills, for use
    /// in a `tokio::select!` alongside the channel receive.
    pub fn deadline(&self) -> Instant {
        self.deadline.unwrap_or_else(|| Instant::now() + self.batch_timeout)
    }

    pub fn timed_out(&self) -> bool {
        self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Drain and return the accumulated batch, resetting the deadline.
    pub fn take(&mut self) -> Vec<FusedRecord> {
        self.deadline = None;
        std::mem::take(&mut self.records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_types::{EntityKey, NormMsg, Source};

    fn record(ts: i64) -> FusedRecord {
        FusedRecord {
            msg: NormMsg {
                key: EntityKey::vessel_from_mmsi("367000001").unwrap(),
                source: Source::AisVendorWs,
                source_weight: 0.9,
                ts,
                ingest_ts: ts,
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
            published_at: ts,
        }
    }

    #[test]
    fn flushes_once_batch_size_is_reached() {
        let mut batch = BatchAccumulator::new(2, 2_000);
        assert!(!batch.push(record(1)));
        assert!(batch.push(record(2)));
        let drained = batch.take();
        assert_eq!(drained.len(), 2);
        assert!(batch.is_empty());
    }
}
