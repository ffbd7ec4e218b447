//! Drives the fusion engine and the broadcast gateway's viewport filter
//! through end-to-end scenarios, using the public API exposed by the
//! `fusion-backend` library target.

use fusion_backend::fusion::{FusionEngine, FusionParams};
use fusion_backend::geo::Viewport;
use fusion_types::{EntityKey, NormMsg, Source};

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

/// Feed A at T with weight 0.9, feed B at T+500ms with weight 0.85.
/// Expected: one publish at T+500ms with B's coordinates.
#[tokio::test]
async fn two_sources_one_entity_publishes_the_newer_record() {
    let engine = FusionEngine::new();
    let key = EntityKey::vessel_from_mmsi("367000001").unwrap();
    let t = 1_700_000_000_000;
    let now = t + 500;

    engine
        .ingest(msg(&key, Source::AisVendorWs, t, 37.80, -122.40, 0.9), params(), now)
        .await;
    engine
        .ingest(msg(&key, Source::AisSignalR, t + 500, 37.81, -122.41, 0.85), params(), now)
        .await;

    let decision = engine.decide(&key, params(), now).await;
    assert!(decision.publish);
    let best = decision.best.unwrap();
    assert_eq!(best.ts, t + 500);
    assert_eq!((best.lat, best.lon), (37.81, -122.41));
}

/// Successive messages 2s apart, ~2m apart, under both `minMoveMeters=5`
/// and `publishMinInterval=5000`. Only the first publishes.
#[tokio::test]
async fn below_move_threshold_within_rate_window_suppresses_second_publish() {
    let engine = FusionEngine::new();
    let key = EntityKey::vessel_from_mmsi("367000002").unwrap();
    let t0 = 1_700_000_000_000;

    engine
        .ingest(msg(&key, Source::AisVendorWs, t0, 10.0000, 10.0000, 0.9), params(), t0)
        .await;
    let first = engine.decide(&key, params(), t0).await;
    assert!(first.publish);
    engine.mark_published(&key, t0, 10.0000, 10.0000).await;

    let t1 = t0 + 2_000;
    // ~2m north at the equator.
    engine
        .ingest(msg(&key, Source::AisVendorWs, t1, 10.000018, 10.0000, 0.9), params(), t1)
        .await;
    let second = engine.decide(&key, params(), t1).await;
    assert!(!second.publish, "should be suppressed: rate-limited and under the move threshold");
}

/// No messages for 10 minutes, then one timestamped 7 minutes in the past
/// arrives. With the default `allowedLatenessMs=30s` it is too late to
/// publish, but it is still considered for the backfill/history path
/// (`best` is still returned).
#[tokio::test]
async fn backfill_after_gap_is_retained_but_not_published() {
    let engine = FusionEngine::new();
    let key = EntityKey::vessel_from_mmsi("367000003").unwrap();
    let t0 = 1_700_000_000_000;

    engine
        .ingest(msg(&key, Source::AisVendorWs, t0, 1.0, 1.0, 0.9), params(), t0)
        .await;
    engine.mark_published(&key, t0, 1.0, 1.0).await;

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
    assert!(!decision.publish, "30s lateness window has long since passed");
    assert!(decision.best.is_some(), "backfill path still surfaces a candidate for history");
}

/// Subscriber viewport `[-123, 37, -122, 38]`. A publish at
/// (-124, 37.5) is outside; one at (-122.5, 37.5) is inside.
#[test]
fn viewport_filter_matches_bbox_edges() {
    let vp = Viewport::from_bbox([-123.0, 37.0, -122.0, 38.0]);
    assert!(!vp.contains(37.5, -124.0));
    assert!(vp.contains(37.5, -122.5));
}

/// Two independent entities never block each other: publishing for one
/// key does not affect the window or last-published state of another.
#[tokio::test]
async fn entities_are_independent() {
    let engine = FusionEngine::new();
    let key_a = EntityKey::vessel_from_mmsi("111111111").unwrap();
    let key_b = EntityKey::aircraft_from(Some("BA123"), None, None).unwrap();
    let t0 = 1_700_000_000_000;

    engine
        .ingest(msg(&key_a, Source::AisVendorWs, t0, 1.0, 1.0, 0.9), params(), t0)
        .await;
    engine
        .ingest(msg(&key_b, Source::Adsb, t0, 2.0, 2.0, 0.95), params(), t0)
        .await;

    let decide_a = engine.decide(&key_a, params(), t0).await;
    let decide_b = engine.decide(&key_b, params(), t0).await;
    assert!(decide_a.publish);
    assert!(decide_b.publish);
    assert_eq!(decide_a.best.unwrap().key, key_a);
    assert_eq!(decide_b.best.unwrap().key, key_b);
}
