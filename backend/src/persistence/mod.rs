//! Dual-store persistence: hot view (redis) + history (Postgres), batched
//! and write-through: the hot view is always updated, history insertion
//! can lag or fail independently.

pub mod batch;
pub mod history;
pub mod hot_view;

use redis::aio::ConnectionManager;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::warn;

use fusion_types::FusedRecord;

use crate::errors::PersistError;

pub struct PersistenceLayer {
    pg: PgPool,
    redis: Mutex<ConnectionManager>,
    hot_view_ttl_s: u64,
}

impl PersistenceLayer {
    pub fn new(pg: PgPool, redis: ConnectionManager, hot_view_ttl_s: u64) -> Self {
        Self {
            pg,
            redis: Mutex::new(redis),
            hot_view_ttl_s,
        }
    }

    /// Write-through the hot view for one record. On a transient failure,
    /// retried once inline; a second failure is surfaced to the caller so
    /// it can DLQ-enqueue.
    pub async fn persist_hot_view(&self, rec: &FusedRecord) -> Result<(), PersistError> {
        let mut conn = self.redis.lock().await;
        match hot_view::upsert(&mut conn, rec, self.hot_view_ttl_s).await {
            Ok(()) => Ok(()),
            Err(first_err) => {
                warn!(error = %first_err, "hot view write failed, retrying once");
                hot_view::upsert(&mut conn, rec, self.hot_view_ttl_s).await
            }
        }
    }

    /// Flush a batch to history. Failures here do not roll back the hot
    /// view — reads remain current while the caller DLQ-enqueues the
    /// failed records.
    pub async fn flush_history(&self, records: &[FusedRecord]) -> Result<(), PersistError> {
        history::flush_batch(&self.pg, records).await
    }

    pub async fn sweep_retention(&self, now_ms: i64, retention_ms: i64) -> Result<u64, PersistError> {
        let mut conn = self.redis.lock().await;
        hot_view::sweep_retention(&mut conn, now_ms, retention_ms).await
    }

    pub async fn active_keys_since(&self, now_ms: i64, stale_cutoff_ms: i64) -> Result<Vec<String>, PersistError> {
        let mut conn = self.redis.lock().await;
        hot_view::active_keys_since(&mut conn, now_ms, stale_cutoff_ms).await
    }

    pub async fn active_count(&self) -> Result<u64, PersistError> {
        let mut conn = self.redis.lock().await;
        hot_view::active_count(&mut conn).await
    }

    pub async fn latest_for(&self, key: &str) -> Result<Option<hot_view::LatestPosition>, PersistError> {
        let mut conn = self.redis.lock().await;
        hot_view::get_latest(&mut conn, key).await
    }
}
