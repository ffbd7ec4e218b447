//! Runtime-tunable settings, loaded once from environment variables and held
//! behind a read-mostly lock so a `config:update` bus message can hot-swap
//! them without restarting.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub window_ms: i64,
    pub allowed_lateness_ms: i64,
    pub min_move_meters: f64,
    pub publish_min_interval_ms: i64,
    pub max_age_ms: Option<i64>,
    pub accept_all: bool,
    pub hot_view_ttl_s: u64,
    pub retention_ms: i64,
    pub dlq_max_retries: u32,
    pub dlq_retry_interval_s: u64,
    pub dlq_batch_size: usize,
    pub broadcast_interval_ms: u64,
    pub max_parallel_fusion: usize,
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub min_client_move_meters: f64,
    pub client_keepalive_ms: i64,
    pub stale_cutoff_ms: i64,
    /// Optional history min-move filter: skip the history
    /// insert when the new position is both closer than this *and* sooner
    /// than `max_position_age_ms` after the last one. `0.0` (default)
    /// disables the filter — every published record hits history, as the
    /// fusion engine's own move/rate gates already keep publish volume
    /// reasonable.
    pub min_position_distance_m: f64,
    pub max_position_age_ms: i64,
    pub max_reconnect_attempts: u32,
    pub max_batch_bytes: usize,
    pub cross_process: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            window_ms: env_or("WINDOW_MS", 60_000),
            allowed_lateness_ms: env_or("ALLOWED_LATENESS_MS", 30_000),
            min_move_meters: env_or("MIN_MOVE_METERS", 5.0),
            publish_min_interval_ms: env_or("PUBLISH_MIN_INTERVAL_MS", 5_000),
            max_age_ms: std::env::var("MAX_AGE_MS").ok().and_then(|v| v.parse().ok()),
            accept_all: env_or("ACCEPT_ALL", false),
            hot_view_ttl_s: env_or("HOT_VIEW_TTL_S", 1_800),
            retention_ms: env_or("RETENTION_MS", 32_400_000),
            dlq_max_retries: env_or("DLQ_MAX_RETRIES", 5),
            dlq_retry_interval_s: env_or("DLQ_RETRY_INTERVAL_S", 300),
            dlq_batch_size: env_or("DLQ_BATCH_SIZE", 100),
            broadcast_interval_ms: env_or("BROADCAST_INTERVAL_MS", 5_000),
            max_parallel_fusion: env_or("MAX_PARALLEL_FUSION", 10),
            batch_size: env_or("BATCH_SIZE", 50),
            batch_timeout_ms: env_or("BATCH_TIMEOUT_MS", 2_000),
            min_client_move_meters: env_or("MIN_CLIENT_MOVE_METERS", 5.0),
            client_keepalive_ms: env_or("CLIENT_KEEPALIVE_MS", 30_000),
            stale_cutoff_ms: env_or("STALE_CUTOFF_MS", 24 * 3_600_000),
            min_position_distance_m: env_or("MIN_POSITION_DISTANCE_M", 0.0),
            max_position_age_ms: env_or("MAX_POSITION_AGE_MS", 0),
            max_reconnect_attempts: env_or("MAX_RECONNECT_ATTEMPTS", 20),
            max_batch_bytes: env_or("MAX_BATCH_BYTES", 1024 * 1024),
            cross_process: env_or("CROSS_PROCESS_BUS", false),
        }
    }
}

/// Process-wide settings holder. Read-mostly; mutated only in response to a
/// `config:update` bus message. Never lazily mutated from request paths.
#[derive(Clone)]
pub struct SharedSettings(Arc<RwLock<Settings>>);

impl SharedSettings {
    pub fn new(settings: Settings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }

    pub async fn get(&self) -> Settings {
        self.0.read().await.clone()
    }

    pub async fn replace(&self, settings: Settings) {
        info!("settings reloaded via config:update");
        *self.0.write().await = settings;
    }
}
