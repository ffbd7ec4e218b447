//! The single scoring policy lever: `score = 0.5*recency +
//! 0.3*sourceWeight + 0.2*physicalValid`. Kept as a free function so the
//! engine and any future tuning pass share one implementation.

use fusion_types::NormMsg;

const RECENCY_WEIGHT: f64 = 0.5;
const SOURCE_WEIGHT: f64 = 0.3;
const SANITY_WEIGHT: f64 = 0.2;
const RECENCY_HORIZON_MINUTES: f64 = 15.0;

pub fn score(msg: &NormMsg, now_ms: i64) -> f64 {
    let recency = (1.0 - msg.age_minutes(now_ms) / RECENCY_HORIZON_MINUTES).max(0.0);
    let physical_valid = if msg.sane { 1.0 } else { 0.0 };
    RECENCY_WEIGHT * recency + SOURCE_WEIGHT * msg.source_weight + SANITY_WEIGHT * physical_valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use fusion_types::{EntityKey, Source};

    fn msg(ts: i64, sane: bool, source_weight: f64) -> NormMsg {
        NormMsg {
            key: EntityKey::vessel_from_mmsi("367000001").unwrap(),
            source: Source::AisVendorWs,
            source_weight,
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
            sane,
        }
    }

    #[test]
    fn fresh_sane_message_scores_higher_than_stale_insane_one() {
        let now = 1_700_000_000_000;
        let fresh = score(&msg(now, true, 0.9), now);
        let stale = score(&msg(now - 20 * 60_000, false, 0.9), now);
        assert!(fresh > stale);
    }

    #[test]
    fn recency_floors_at_zero_past_the_horizon() {
        let now = 1_700_000_000_000;
        let ancient = msg(now - 60 * 60_000, true, 0.9);
        assert_eq!(score(&ancient, now), SOURCE_WEIGHT * 0.9 + SANITY_WEIGHT);
    }
}
