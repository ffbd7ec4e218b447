//! Redis-backed hot view: "where is entity X right now".
//!
//! Three structures, all written as one pipelined batch so the
//! view never shows a partial update:
//! - a geospatial set (`GEOADD`) for nearest/bbox-style queries,
//! - a `latest:{key}` hash with the current fields, TTL'd,
//! - an `active` sorted set scored by `ts`, used for retention sweeps.

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{debug, info};

use fusion_types::FusedRecord;

use crate::errors::PersistError;

const GEO_KEY: &str = "fusion:geo";
const ACTIVE_KEY: &str = "fusion:active";

pub async fn connect(url: &str) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(url)?;
    client.get_connection_manager().await
}

/// Pipelined write of the geo index, latest-record hash, and active set
/// membership for one record. All three commands share one round trip.
pub async fn upsert(
    conn: &mut ConnectionManager,
    rec: &FusedRecord,
    ttl_s: u64,
) -> Result<(), PersistError> {
    let key = rec.key().to_string();
    let latest_key = format!("latest:{key}");

    let mut pipe = redis::pipe();
    pipe.atomic()
        .cmd("GEOADD")
        .arg(GEO_KEY)
        .arg(rec.msg.lon)
        .arg(rec.msg.lat)
        .arg(&key)
        .ignore()
        .hset(&latest_key, "lat", rec.msg.lat)
        .ignore()
        .hset(&latest_key, "lon", rec.msg.lon)
        .ignore()
        .hset(&latest_key, "ts", rec.msg.ts)
        .ignore()
        .hset(&latest_key, "speed", rec.msg.speed.unwrap_or_default())
        .ignore()
        .hset(&latest_key, "course", rec.msg.course.unwrap_or_default())
        .ignore()
        .hset(&latest_key, "heading", rec.msg.heading.unwrap_or_default())
        .ignore()
        .hset(&latest_key, "status", rec.msg.status.clone().unwrap_or_default())
        .ignore()
        .hset(&latest_key, "source", rec.msg.source.id_str())
        .ignore()
        .hset(&latest_key, "score", rec.score)
        .ignore()
        .hset(&latest_key, "name", rec.msg.name.clone().unwrap_or_default())
        .ignore()
        .expire(&latest_key, ttl_s as i64)
        .ignore()
        .zadd(ACTIVE_KEY, &key, rec.msg.ts)
        .ignore();

    pipe.query_async::<_, ()>(conn)
        .await
        .map_err(|e| PersistError::HotViewTransient(e.to_string()))?;

    Ok(())
}

/// Remove active-set members (and their `latest:{key}` hash) last updated
/// before `now - retentionMs`. Runs on a periodic timer rather than a
/// message-count sampling heuristic.
pub async fn sweep_retention(
    conn: &mut ConnectionManager,
    now_ms: i64,
    retention_ms: i64,
) -> Result<u64, PersistError> {
    let cutoff = now_ms - retention_ms;
    let expired: Vec<String> = conn
        .zrangebyscore(ACTIVE_KEY, f64::NEG_INFINITY, cutoff as f64)
        .await
        .map_err(|e| PersistError::HotViewTransient(e.to_string()))?;

    if expired.is_empty() {
        return Ok(0);
    }

    let mut pipe = redis::pipe();
    pipe.atomic();
    for key in &expired {
        pipe.zrem(ACTIVE_KEY, key).ignore();
        pipe.del(format!("latest:{key}")).ignore();
        pipe.cmd("ZREM").arg(GEO_KEY).arg(key).ignore();
    }
    pipe.query_async::<_, ()>(conn)
        .await
        .map_err(|e| PersistError::HotViewTransient(e.to_string()))?;

    debug!(count = expired.len(), "swept expired hot view entries");
    Ok(expired.len() as u64)
}

/// Active entity keys newer than `now - staleCutoffMs`, the candidate set
/// the broadcast gateway walks on each push tick.
pub async fn active_keys_since(
    conn: &mut ConnectionManager,
    now_ms: i64,
    stale_cutoff_ms: i64,
) -> Result<Vec<String>, PersistError> {
    let cutoff = now_ms - stale_cutoff_ms;
    conn.zrangebyscore(ACTIVE_KEY, cutoff as f64, f64::INFINITY)
        .await
        .map_err(|e| PersistError::HotViewTransient(e.to_string()))
}

pub async fn active_count(conn: &mut ConnectionManager) -> Result<u64, PersistError> {
    conn.zcard(ACTIVE_KEY)
        .await
        .map_err(|e| PersistError::HotViewTransient(e.to_string()))
}

/// The fields of `latest:{key}` needed to decide whether to push an update
/// to a given subscriber. `None` if the hash has
/// expired or was never written.
#[derive(Debug, Clone)]
pub struct LatestPosition {
    pub lat: f64,
    pub lon: f64,
    pub ts: i64,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    pub heading: Option<f64>,
    pub status: Option<String>,
    pub source: String,
    pub score: f64,
}

pub async fn get_latest(conn: &mut ConnectionManager, key: &str) -> Result<Option<LatestPosition>, PersistError> {
    let fields: HashMap<String, String> = conn
        .hgetall(format!("latest:{key}"))
        .await
        .map_err(|e| PersistError::HotViewTransient(e.to_string()))?;

    if fields.is_empty() {
        return Ok(None);
    }

    let parse = |name: &str| -> Option<f64> { fields.get(name).and_then(|v| v.parse().ok()) };
    let Some(lat) = parse("lat") else { return Ok(None) };
    let Some(lon) = parse("lon") else { return Ok(None) };
    let Some(ts) = fields.get("ts").and_then(|v| v.parse::<i64>().ok()) else {
        return Ok(None);
    };

    Ok(Some(LatestPosition {
        lat,
        lon,
        ts,
        speed: parse("speed"),
        course: parse("course"),
        heading: parse("heading"),
        status: fields.get("status").filter(|s| !s.is_empty()).cloned(),
        source: fields.get("source").cloned().unwrap_or_default(),
        score: parse("score").unwrap_or(0.0),
    }))
}

pub fn log_connected(url: &str) {
    info!(url, "connected to hot view store");
}
