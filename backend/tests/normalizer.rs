//! MMSI normalization, timestamp disambiguation, and sanity-gate cases
//! driven through the public normalizer entry point.

use fusion_backend::errors::RejectReason;
use fusion_backend::normalizer::normalize;
use fusion_backend::raw::RawMsg;
use fusion_types::Source;
use serde_json::json;

fn raw(source: Source, payload: serde_json::Value) -> RawMsg {
    RawMsg {
        source,
        received_at: 1_700_000_000_000,
        payload,
    }
}

#[test]
fn mmsi_with_surrounding_whitespace_pads_to_nine_digits() {
    let msg = normalize(
        &raw(Source::AisVendorWs, json!({"mmsi": " 0012345 ", "lat": 1.0, "lon": 1.0, "ts": 1_700_000_000_000i64})),
        None,
        1_700_000_000_000,
    )
    .unwrap();
    assert_eq!(msg.key.id(), "000012345");
}

#[test]
fn all_nines_mmsi_is_rejected() {
    let result = normalize(
        &raw(Source::AisVendorWs, json!({"mmsi": "999999999", "lat": 1.0, "lon": 1.0, "ts": 1})),
        None,
        1_700_000_000_000,
    );
    assert!(matches!(result, Err(RejectReason::BadKey(_))));
}

#[test]
fn non_numeric_mmsi_is_rejected() {
    let result = normalize(
        &raw(Source::AisVendorWs, json!({"mmsi": "ABC123", "lat": 1.0, "lon": 1.0, "ts": 1})),
        None,
        1_700_000_000_000,
    );
    assert!(matches!(result, Err(RejectReason::BadKey(_))));
}

#[test]
fn epoch_seconds_and_milliseconds_disambiguate_by_magnitude() {
    let from_seconds = normalize(
        &raw(Source::AisVendorWs, json!({"mmsi": "367000001", "lat": 1.0, "lon": 1.0, "ts": 1_700_000_000})),
        None,
        1_700_000_000_000,
    )
    .unwrap();
    let from_millis = normalize(
        &raw(Source::AisVendorWs, json!({"mmsi": "367000001", "lat": 1.0, "lon": 1.0, "ts": 1_700_000_000_000i64})),
        None,
        1_700_000_000_000,
    )
    .unwrap();
    assert_eq!(from_seconds.ts, 1_700_000_000_000);
    assert_eq!(from_millis.ts, 1_700_000_000_000);
}

#[test]
fn iso8601_timestamp_parses_to_utc_millis() {
    let msg = normalize(
        &raw(
            Source::AisSignalR,
            json!({"MMSI": "367000001", "Lat": 1.0, "Lon": 1.0, "Timestamp": "2023-11-14T22:13:20Z"}),
        ),
        None,
        1_700_000_000_000,
    )
    .unwrap();
    assert_eq!(msg.ts, 1_700_000_000_000);
}

#[test]
fn varied_casing_across_signalr_rows_is_reconciled_to_one_schema() {
    let msg = normalize(
        &raw(
            Source::AisSignalR,
            json!({"MMSI": "367000004", "latitude": 10.0, "longitude": 20.0, "ts": 1_700_000_000_000i64}),
        ),
        None,
        1_700_000_000_000,
    )
    .unwrap();
    assert_eq!(msg.key.id(), "367000004");
    assert_eq!((msg.lat, msg.lon), (10.0, 20.0));
}

#[test]
fn out_of_range_aircraft_latitude_is_rejected() {
    let result = normalize(
        &raw(Source::Adsb, json!({"flight": "BA123", "lat": 89.0, "lon": 1.0, "ts": 1})),
        None,
        1_700_000_000_000,
    );
    assert!(matches!(result, Err(RejectReason::BadPosition(_))));
}

#[test]
fn stale_message_beyond_configured_max_age_is_rejected() {
    let result = normalize(
        &raw(Source::AisVendorWs, json!({"mmsi": "367000001", "lat": 1.0, "lon": 1.0, "ts": 0})),
        Some(1_000),
        1_700_000_000_000,
    );
    assert!(matches!(result, Err(RejectReason::StaleAge)));
}

#[test]
fn over_budget_altitude_marks_insane_but_is_not_rejected() {
    let msg = normalize(
        &raw(
            Source::Adsb,
            json!({"flight": "BA123", "lat": 10.0, "lon": 10.0, "ts": 1_700_000_000_000i64, "altitude": 70_000.0}),
        ),
        None,
        1_700_000_000_000,
    )
    .unwrap();
    assert!(!msg.sane);
}
