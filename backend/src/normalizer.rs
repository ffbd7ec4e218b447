//! Turns a heterogeneous `RawMsg` into the canonical `NormMsg`, or a typed
//! rejection reason. This is the only place that enumerates per-source
//! field names — everything downstream sees `NormMsg` only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::debug;

use fusion_types::{EntityKey, KeyError, NormMsg, Source};

use crate::errors::RejectReason;
use crate::raw::RawMsg;

const AIRCRAFT_MAX_SPEED_KN: f64 = 650.0;
const AIRCRAFT_MAX_ALTITUDE_FT: f64 = 60_000.0;
const MAX_SANE_AGE_MS: i64 = 24 * 3_600_000;

/// Reject counts keyed by `(source, reason)`, plus the sampled-logging gate.
/// Grounded in the ingest command's per-source reject counters.
#[derive(Default)]
pub struct RejectStats {
    counts: DashMap<(Source, &'static str), AtomicU64>,
    last_logged_ms: DashMap<(Source, &'static str), AtomicU64>,
}

impl RejectStats {
    /// Log at most one example of each `(source, reason)` rejection every
    /// `sample_interval_ms`, so a noisy bad feed doesn't flood the logs.
    pub fn record(&self, source: Source, reason: &RejectReason, sample_interval_ms: i64, now_ms: i64) {
        let kind = reason_kind(reason);
        self.counts
            .entry((source, kind))
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);

        let entry = self
            .last_logged_ms
            .entry((source, kind))
            .or_insert_with(|| AtomicU64::new(0));
        let last = entry.load(Ordering::Relaxed) as i64;
        if now_ms - last >= sample_interval_ms {
            entry.store(now_ms as u64, Ordering::Relaxed);
            debug!(%source, reason = %reason, "rejected record (sampled)");
        }
    }

    pub fn count(&self, source: Source, kind: &'static str) -> u64 {
        self.counts
            .get(&(source, kind))
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }
}

fn reason_kind(reason: &RejectReason) -> &'static str {
    match reason {
        RejectReason::BadKey(_) => "bad_key",
        RejectReason::BadPosition(_) => "bad_position",
        RejectReason::BadTimestamp(_) => "bad_timestamp",
        RejectReason::StaleAge => "stale_age",
    }
}

pub type SharedRejectStats = Arc<RejectStats>;

/// Key derivation, position parsing, timestamp parsing, and the sanity gate,
/// in order, collapsing a raw per-source payload into one normalized
/// record — every failure mode becomes a `RejectReason`.
pub fn normalize(raw: &RawMsg, max_age_ms: Option<i64>, now_ms: i64) -> Result<NormMsg, RejectReason> {
    let obj = raw
        .payload
        .as_object()
        .ok_or_else(|| RejectReason::BadKey("payload is not a JSON object".to_string()))?;

    let key = extract_key(obj, raw.source)?;
    let (lat, lon) = extract_position(obj, key.kind())?;
    let ts = extract_timestamp(obj, raw.received_at)?;

    if let Some(max_age) = max_age_ms {
        if now_ms - ts > max_age {
            return Err(RejectReason::StaleAge);
        }
    }

    let speed = find_f64(obj, &["speed", "Speed", "sog", "SOG", "gs", "velocity"]);
    let course = find_f64(obj, &["course", "Course", "cog", "COG", "track"]);
    let heading = find_f64(obj, &["heading", "Heading", "hdg", "trueHeading"]);
    let altitude = find_f64(obj, &["altitude", "Altitude", "alt_baro", "alt_geom"]);
    let status = find_str(obj, &["status", "Status", "navStatus", "NavigationalStatus"]);
    let name = find_str(obj, &["name", "Name", "shipName", "ShipName", "flight"]);
    let callsign = find_str(obj, &["callsign", "Callsign", "CallSign", "flight"]);

    let sane = is_sane(key.kind(), lat, lon, ts, now_ms, speed, altitude);

    Ok(NormMsg {
        key,
        source: raw.source,
        source_weight: raw.source.default_weight(),
        ts,
        ingest_ts: raw.received_at,
        lat,
        lon,
        speed,
        course,
        heading,
        altitude,
        status,
        name,
        callsign,
        sane,
    })
}

fn extract_key(
    obj: &serde_json::Map<String, Value>,
    source: Source,
) -> Result<EntityKey, RejectReason> {
    if source == Source::Adsb {
        let flight = find_str(obj, &["flight", "Flight"]);
        let registration = find_str(obj, &["registration", "reg", "r"]);
        let callsign = find_str(obj, &["callsign", "Callsign"]);
        return EntityKey::aircraft_from(
            flight.as_deref(),
            registration.as_deref(),
            callsign.as_deref(),
        )
        .map_err(key_error_to_reject);
    }

    // AIS sources key by MMSI regardless of field casing.
    let mmsi = find_str(obj, &["mmsi", "MMSI", "Mmsi"]);
    match mmsi {
        Some(raw_mmsi) => EntityKey::vessel_from_mmsi(&raw_mmsi).map_err(key_error_to_reject),
        None => Err(RejectReason::BadKey("no mmsi field present".to_string())),
    }
}

fn key_error_to_reject(e: KeyError) -> RejectReason {
    RejectReason::BadKey(e.to_string())
}

fn extract_position(
    obj: &serde_json::Map<String, Value>,
    kind: fusion_types::EntityKind,
) -> Result<(f64, f64), RejectReason> {
    let lat = find_f64(obj, &["lat", "Lat", "latitude", "Latitude"])
        .ok_or_else(|| RejectReason::BadPosition("missing latitude".to_string()))?;
    let lon = find_f64(obj, &["lon", "Lon", "lng", "longitude", "Longitude"])
        .ok_or_else(|| RejectReason::BadPosition("missing longitude".to_string()))?;

    if lat.is_nan() || lon.is_nan() {
        return Err(RejectReason::BadPosition("lat/lon is NaN".to_string()));
    }
    if !(-180.0..=180.0).contains(&lon) {
        return Err(RejectReason::BadPosition(format!("lon {lon} out of range")));
    }
    let lat_bound = match kind {
        fusion_types::EntityKind::Vessel => 90.0,
        fusion_types::EntityKind::Aircraft => 85.0,
    };
    if lat.abs() > lat_bound {
        return Err(RejectReason::BadPosition(format!("lat {lat} out of range")));
    }

    Ok((lat, lon))
}

/// Accepts an ISO-8601 string, an integer epoch (seconds or milliseconds,
/// disambiguated by magnitude), or falls back to ingest time if no
/// timestamp field is present at all.
fn extract_timestamp(
    obj: &serde_json::Map<String, Value>,
    received_at: i64,
) -> Result<i64, RejectReason> {
    let candidates = ["ts", "timestamp", "Timestamp", "time", "Time", "lastUpdate"];
    let Some(value) = candidates.iter().find_map(|k| obj.get(*k)) else {
        return Ok(received_at);
    };

    match value {
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.timestamp_millis())
            .map_err(|e| RejectReason::BadTimestamp(e.to_string())),
        Value::Number(n) => {
            let raw = n
                .as_f64()
                .ok_or_else(|| RejectReason::BadTimestamp("timestamp is not a number".to_string()))?;
            if raw.is_nan() || raw < 0.0 {
                return Err(RejectReason::BadTimestamp(format!("implausible timestamp {raw}")));
            }
            // Epoch seconds land well under 10^12 until the year 33658;
            // anything above that magnitude is already milliseconds.
            if raw < 1e12 {
                Ok((raw * 1000.0) as i64)
            } else {
                Ok(raw as i64)
            }
        }
        _ => Err(RejectReason::BadTimestamp("unsupported timestamp shape".to_string())),
    }
}

fn is_sane(
    kind: fusion_types::EntityKind,
    lat: f64,
    lon: f64,
    ts: i64,
    now_ms: i64,
    speed: Option<f64>,
    altitude: Option<f64>,
) -> bool {
    let lat_ok = match kind {
        fusion_types::EntityKind::Vessel => lat.abs() <= 85.0,
        fusion_types::EntityKind::Aircraft => lat.abs() <= 85.0,
    };
    let lon_ok = lon.abs() <= 180.0;
    let age_ok = (now_ms - ts) <= MAX_SANE_AGE_MS;
    let speed_ok = speed.map(|s| s <= AIRCRAFT_MAX_SPEED_KN).unwrap_or(true);
    let altitude_ok = altitude.map(|a| a <= AIRCRAFT_MAX_ALTITUDE_FT).unwrap_or(true);

    lat_ok && lon_ok && age_ok && speed_ok && altitude_ok
}

fn find_f64(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| obj.get(*k)).and_then(Value::as_f64)
}

fn find_str(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(source: Source, payload: Value) -> RawMsg {
        RawMsg {
            source,
            received_at: 1_700_000_000_000,
            payload,
        }
    }

    #[test]
    fn normalizes_mmsi_with_interleaved_noise() {
        let msg = normalize(
            &raw(
                Source::AisVendorWs,
                json!({"mmsi": "36-700-0001", "lat": 37.8, "lon": -122.4, "ts": 1_700_000_000_000i64}),
            ),
            None,
            1_700_000_000_000,
        )
        .unwrap();
        assert_eq!(msg.key.id(), "367000001");
        assert!(msg.sane);
    }

    #[test]
    fn rejects_missing_mmsi() {
        let result = normalize(
            &raw(Source::AisVendorWs, json!({"lat": 1.0, "lon": 2.0})),
            None,
            1_700_000_000_000,
        );
        assert!(matches!(result, Err(RejectReason::BadKey(_))));
    }

    #[test]
    fn rejects_out_of_range_longitude() {
        let result = normalize(
            &raw(
                Source::AisVendorWs,
                json!({"mmsi": "367000001", "lat": 1.0, "lon": 999.0, "ts": 1}),
            ),
            None,
            1_700_000_000_000,
        );
        assert!(matches!(result, Err(RejectReason::BadPosition(_))));
    }

    #[test]
    fn disambiguates_epoch_seconds_from_milliseconds() {
        let msg_s = normalize(
            &raw(
                Source::AisVendorWs,
                json!({"mmsi": "367000001", "lat": 1.0, "lon": 2.0, "ts": 1_700_000_000}),
            ),
            None,
            1_700_000_000_000,
        )
        .unwrap();
        assert_eq!(msg_s.ts, 1_700_000_000_000);
    }

    #[test]
    fn rejects_messages_older_than_max_age() {
        let result = normalize(
            &raw(
                Source::AisVendorWs,
                json!({"mmsi": "367000001", "lat": 1.0, "lon": 2.0, "ts": 0}),
            ),
            Some(1_000),
            1_700_000_000_000,
        );
        assert!(matches!(result, Err(RejectReason::StaleAge)));
    }

    #[test]
    fn aircraft_key_prefers_flight_over_callsign() {
        let msg = normalize(
            &raw(
                Source::Adsb,
                json!({"flight": "BA123 ", "lat": 10.0, "lon": 20.0, "ts": 1_700_000_000_000i64, "speed": 400.0, "altitude": 35000.0}),
            ),
            None,
            1_700_000_000_000,
        )
        .unwrap();
        assert_eq!(msg.key.id(), "BA123");
        assert!(msg.sane);
    }

    #[test]
    fn implausible_aircraft_speed_marks_insane_but_does_not_reject() {
        let msg = normalize(
            &raw(
                Source::Adsb,
                json!({"flight": "BA123", "lat": 10.0, "lon": 20.0, "ts": 1_700_000_000_000i64, "speed": 5000.0}),
            ),
            None,
            1_700_000_000_000,
        )
        .unwrap();
        assert!(!msg.sane);
    }
}
