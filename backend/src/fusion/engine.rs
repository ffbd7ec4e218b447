//! Per-entity sliding-window fusion. State is sharded by a hash
//! of `EntityKey` so concurrent `Ingest`/`Decide` calls for different
//! entities never contend on the same lock.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use tokio::sync::RwLock;

use fusion_types::{EntityKey, NormMsg};

use crate::fusion::scoring::score;
use crate::geo::haversine_m;

const SHARD_COUNT: usize = 32;

#[derive(Debug, Clone, Copy)]
struct Published {
    ts: i64,
    lat: f64,
    lon: f64,
}

struct Shard {
    windows: RwLock<HashMap<EntityKey, VecDeque<NormMsg>>>,
    last_published: RwLock<HashMap<EntityKey, Published>>,
}

impl Shard {
    fn new() -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            last_published: RwLock::new(HashMap::new()),
        }
    }
}

pub struct DecideResult {
    pub best: Option<NormMsg>,
    pub score: f64,
    pub publish: bool,
}

/// Tunables read fresh on every call rather than stored, so a
/// `config:update` reload applies to subsequently-ingested messages without
/// resetting in-flight windows.
#[derive(Debug, Clone, Copy)]
pub struct FusionParams {
    pub window_ms: i64,
    pub allowed_lateness_ms: i64,
    pub min_move_meters: f64,
    pub publish_min_interval_ms: i64,
    pub accept_all: bool,
}

pub struct FusionEngine {
    shards: Vec<Shard>,
}

impl FusionEngine {
    pub fn new() -> Self {
        let shards = (0..SHARD_COUNT).map(|_| Shard::new()).collect();
        Self { shards }
    }

    fn shard_for(&self, key: &EntityKey) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.shards.len();
        &self.shards[idx]
    }

    /// Append `msg` to its entity's window, then front-truncate anything
    /// older than `now - windowMs`.
    /// `acceptAll` disables trimming for historical replay.
    pub async fn ingest(&self, msg: NormMsg, params: FusionParams, now_ms: i64) {
        let shard = self.shard_for(&msg.key);
        let mut windows = shard.windows.write().await;
        let window = windows.entry(msg.key.clone()).or_default();

        window.push_back(msg);
        let out_of_order = window.len() >= 2
            && window[window.len() - 1].ts < window[window.len() - 2].ts;
        if out_of_order {
            window.make_contiguous().sort_by_key(|m| m.ts);
        }

        if !params.accept_all {
            let cutoff = now_ms - params.window_ms;
            while let Some(front) = window.front() {
                if front.ts < cutoff {
                    window.pop_front();
                } else {
                    break;
                }
            }
        }
    }

    /// Picks the current best candidate for `key` and decides whether it's
    /// publishable against the rate/move gates and monotonic-time invariant.
    pub async fn decide(&self, key: &EntityKey, params: FusionParams, now_ms: i64) -> DecideResult {
        let shard = self.shard_for(key);
        let windows = shard.windows.read().await;
        let Some(window) = windows.get(key) else {
            return DecideResult {
                best: None,
                score: 0.0,
                publish: false,
            };
        };

        let last_published = shard.last_published.read().await;
        let last = last_published.get(key).copied();

        let candidates: Vec<&NormMsg> = window
            .iter()
            .filter(|m| {
                let newer_than_last = last.map(|l| m.ts > l.ts).unwrap_or(true);
                let not_too_late = now_ms - m.ts <= params.allowed_lateness_ms;
                newer_than_last && not_too_late && m.sane
            })
            .collect();

        let best = if !candidates.is_empty() {
            pick_best(&candidates, now_ms)
        } else {
            // Backfill-history path: argmax over the full window by score
            // alone, regardless of sanity/lateness/ts — a different
            // selection rule than the publish path's tie-break chain, and
            // never published.
            let all: Vec<&NormMsg> = window.iter().collect();
            pick_best_by_score(&all, now_ms)
        };

        let Some(best) = best else {
            return DecideResult {
                best: None,
                score: 0.0,
                publish: false,
            };
        };

        let best_score = score(best, now_ms);
        let publish = match last {
            None => candidates.iter().any(|c| std::ptr::eq(*c, best)),
            Some(l) => {
                let is_candidate = candidates.iter().any(|c| std::ptr::eq(*c, best));
                let monotonic = best.ts > l.ts;
                let rate_ok = best.ts - l.ts >= params.publish_min_interval_ms;
                let moved_enough = haversine_m(best.lat, best.lon, l.lat, l.lon) >= params.min_move_meters;
                is_candidate && monotonic && (rate_ok || moved_enough)
            }
        };

        DecideResult {
            best: Some(best.clone()),
            score: best_score,
            publish,
        }
    }

    /// Idempotent: only advances `lastPublishedTs[key]` if `ts` is strictly
    /// greater than what's stored.
    pub async fn mark_published(&self, key: &EntityKey, ts: i64, lat: f64, lon: f64) {
        let shard = self.shard_for(key);
        let mut last_published = shard.last_published.write().await;
        let advance = match last_published.get(key) {
            Some(existing) => ts > existing.ts,
            None => true,
        };
        if advance {
            last_published.insert(key.clone(), Published { ts, lat, lon });
        }
    }

    pub async fn window_key_count(&self) -> usize {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.windows.read().await.len();
        }
        total
    }
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// `argmax` by `(ts desc, score desc, sourceWeight desc, source id asc)` —
/// the canonical tie-break chain.
fn pick_best<'a>(candidates: &[&'a NormMsg], now_ms: i64) -> Option<&'a NormMsg> {
    candidates
        .iter()
        .copied()
        .max_by(|a, b| {
            a.ts.cmp(&b.ts)
                .then_with(|| score(a, now_ms).partial_cmp(&score(b, now_ms)).unwrap())
                .then_with(|| a.source_weight.partial_cmp(&b.source_weight).unwrap())
                .then_with(|| b.source.id_str().cmp(a.source.id_str()))
        })
}

/// `argmax` by score alone — the backfill-history path's selection rule
/// (spec §4.3 step 4), distinct from the publish path's `(ts, score,
/// sourceWeight, source id)` tie-break chain above.
fn pick_best_by_score<'a>(candidates: &[&'a NormMsg], now_ms: i64) -> Option<&'a NormMsg> {
    candidates
        .iter()
        .copied()
        .max_by(|a, b| score(a, now_ms).partial_cmp(&score(b, now_ms)).unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_types::{EntityKey, Source};

    fn params() -> FusionParams {
        FusionParams {
            window_ms: 60_000,
            allowed_lateness_ms: 30_000,
            min_move_meters: 5.0,
            publish_min_interval_ms: 5_000,
            accept_all: false,
        }
    }

    fn msg(key: &EntityKey, source: Source, ts: i64, lat: f64, lon: f64, weight: f64) -> NormMsg {
        NormMsg {
            key: key.clone(),
            source,
            source_weight: weight,
            ts,
            ingest_ts: ts,
            lat,
            lon,
            speed: None,
            course: None,
            heading: None,
            altitude: None,
            status: None,
            name: None,
            callsign: None,
            sane: true,
        }
    }

    #[tokio::test]
    async fn two_sources_one_entity_newer_wins() {
        let engine = FusionEngine::new();
        let key = EntityKey::vessel_from_mmsi("367000001").unwrap();
        let now = 1_700_000_001_000;

        engine
            .ingest(msg(&key, Source::AisVendorWs, 1_700_000_000_000, 37.80, -122.40, 0.9), params(), now)
            .await;
        engine
            .ingest(msg(&key, Source::AisSignalR, 1_700_000_000_500, 37.81, -122.41, 0.85), params(), now)
            .await;

        let decision = engine.decide(&key, params(), now).await;
        assert!(decision.publish);
        let best = decision.best.unwrap();
        assert_eq!(best.ts, 1_700_000_000_500);
        assert_eq!(best.lat, 37.81);
    }

    #[tokio::test]
    async fn below_move_threshold_is_suppressed_after_rate_limited() {
        let engine = FusionEngine::new();
        let key = EntityKey::vessel_from_mmsi("367000001").unwrap();
        let t0 = 1_700_000_000_000;

        engine
            .ingest(msg(&key, Source::AisVendorWs, t0, 37.8000, -122.4000, 0.9), params(), t0)
            .await;
        let first = engine.decide(&key, params(), t0).await;
        assert!(first.publish);
        engine.mark_published(&key, t0, 37.8000, -122.4000).await;

        // 2s later, ~2m away: rate limit not satisfied and move threshold not met.
        let t1 = t0 + 2_000;
        engine
            .ingest(msg(&key, Source::AisVendorWs, t1, 37.80002, -122.4000, 0.9), params(), t1)
            .await;
        let second = engine.decide(&key, params(), t1).await;
        assert!(!second.publish);
    }

    #[tokio::test]
    async fn backfill_after_gap_is_not_published() {
        let engine = FusionEngine::new();
        let key = EntityKey::vessel_from_mmsi("367000001").unwrap();
        let t0 = 1_700_000_000_000;

        engine
            .ingest(msg(&key, Source::AisVendorWs, t0, 1.0, 1.0, 0.9), params(), t0)
            .await;
        engine.mark_published(&key, t0, 1.0, 1.0).await;

        // 7 minutes later a message timestamped 7 minutes in the past arrives.
        let now = t0 + 10 * 60_000;
        let late_ts = now - 7 * 60_000;
        engine
            .ingest(
                msg(&key, Source::AisVendorWs, late_ts, 1.0, 1.0, 0.9),
                FusionParams { accept_all: true, ..params() },
                now,
            )
            .await;

        let decision = engine.decide(&key, params(), now).await;
        assert!(!decision.publish);
        assert!(decision.best.is_some());
    }
}
