//! # fusion-types
//!
//! Canonical domain types shared between the ingest adapters, the
//! normalizer, the fusion engine, and the persistence/broadcast layers of
//! the tracking fusion backend.
//!
//! Nothing in this crate performs I/O — it is the common vocabulary that
//! lets each stage of the pipeline talk about the same entity without
//! depending on any one source's wire format.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ── Entity identity ───────────────────────────────────────────────────────

/// Which kind of moving object an `EntityKey` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Vessel,
    Aircraft,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Vessel => write!(f, "vessel"),
            EntityKind::Aircraft => write!(f, "aircraft"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("MMSI must contain 7-9 digits, got {digits} digits in {raw:?}")]
    MmsiWrongLength { raw: String, digits: usize },
    #[error("MMSI {mmsi} is all-zero or all-nine, which is not a valid vessel identity")]
    MmsiReserved { mmsi: String },
    #[error("no flight id, registration, or callsign was provided for an aircraft key")]
    NoAircraftIdentity,
}

/// Stable `"{kind}:{id}"` identifier for a tracked object, constant for the
/// lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    kind: EntityKind,
    id: String,
}

impl EntityKey {
    /// Normalize a raw MMSI string: strip non-digits, reject
    /// all-zero/all-nine, left-pad to 9 digits. Accepts 7-9 digit inputs
    /// (after stripping), possibly interleaved with non-digit noise.
    pub fn vessel_from_mmsi(raw: &str) -> Result<Self, KeyError> {
        let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
        if digits.len() < 7 || digits.len() > 9 {
            return Err(KeyError::MmsiWrongLength {
                raw: raw.to_string(),
                digits: digits.len(),
            });
        }
        if digits.chars().all(|c| c == '0') || digits.chars().all(|c| c == '9') {
            return Err(KeyError::MmsiReserved { mmsi: digits });
        }
        let padded = format!("{digits:0>9}");
        Ok(Self {
            kind: EntityKind::Vessel,
            id: padded,
        })
    }

    /// Aircraft key precedence: flight id, else registration, else
    /// upper-cased trimmed callsign.
    pub fn aircraft_from(
        flight_id: Option<&str>,
        registration: Option<&str>,
        callsign: Option<&str>,
    ) -> Result<Self, KeyError> {
        let pick = flight_id
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .or_else(|| registration.map(str::trim).filter(|s| !s.is_empty()))
            .or_else(|| callsign.map(str::trim).filter(|s| !s.is_empty()));

        match pick {
            Some(id) => Ok(Self {
                kind: EntityKind::Aircraft,
                id: id.to_uppercase(),
            }),
            None => Err(KeyError::NoAircraftIdentity),
        }
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

// ── Source identity & weighting ───────────────────────────────────────────

/// The three ingress adapters, plus a catch-all for anything the normalizer
/// sees that isn't wired to a dedicated adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    AisVendorWs,
    AisSignalR,
    Adsb,
    Unknown,
}

impl Source {
    /// Lexicographic id used only for deterministic tie-breaking when ts,
    /// score, and source weight are all equal.
    pub fn id_str(&self) -> &'static str {
        match self {
            Source::AisVendorWs => "ais_vendor_ws",
            Source::AisSignalR => "ais_signalr",
            Source::Adsb => "adsb",
            Source::Unknown => "unknown",
        }
    }

    /// Pure function of source identity, clamped to [0, 1]. Unknown source
    /// defaults to 0.8.
    pub fn default_weight(&self) -> f64 {
        let w = match self {
            Source::AisVendorWs => 0.9,
            Source::AisSignalR => 0.85,
            Source::Adsb => 0.95,
            Source::Unknown => 0.8,
        };
        w.clamp(0.0, 1.0)
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id_str())
    }
}

// ── Normalized message ────────────────────────────────────────────────────

/// Canonical normalized position record — the only type that flows into
/// fusion. Produced by the normalizer from a source-specific `RawMsg`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormMsg {
    pub key: EntityKey,
    pub source: Source,
    pub source_weight: f64,
    /// UTC milliseconds, as reported by the source.
    pub ts: i64,
    /// UTC milliseconds, when the normalizer observed the raw record.
    pub ingest_ts: i64,
    pub lat: f64,
    pub lon: f64,
    pub speed: Option<f64>,
    pub course: Option<f64>,
    pub heading: Option<f64>,
    pub altitude: Option<f64>,
    pub status: Option<String>,
    pub name: Option<String>,
    pub callsign: Option<String>,
    /// Result of the physical-plausibility check.
    pub sane: bool,
}

impl NormMsg {
    pub fn age_minutes(&self, now_ms: i64) -> f64 {
        ((now_ms - self.ts).max(0) as f64) / 60_000.0
    }
}

// ── Fused record ──────────────────────────────────────────────────────────

/// The winning `NormMsg` for a publish/backfill decision, plus the score
/// that won it the slot and the wall-clock time it was published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FusedRecord {
    pub msg: NormMsg,
    pub score: f64,
    pub published_at: i64,
}

impl FusedRecord {
    pub fn key(&self) -> &EntityKey {
        &self.msg.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mmsi_pads_to_nine_digits() {
        let key = EntityKey::vessel_from_mmsi(" 0012345 ").unwrap();
        assert_eq!(key.id(), "000012345");
        assert_eq!(key.to_string(), "vessel:000012345");
    }

    #[test]
    fn mmsi_strips_interleaved_noise() {
        let key = EntityKey::vessel_from_mmsi("36-700-0001").unwrap();
        assert_eq!(key.id(), "367000001");
    }

    #[test]
    fn mmsi_rejects_all_nines() {
        assert_eq!(
            EntityKey::vessel_from_mmsi("999999999"),
            Err(KeyError::MmsiReserved {
                mmsi: "999999999".to_string()
            })
        );
    }

    #[test]
    fn mmsi_rejects_all_nines_before_left_padding() {
        // 7 digits, all-nine; left-padding with zero would otherwise mask
        // this as "009999999", which is neither all-zero nor all-nine.
        assert_eq!(
            EntityKey::vessel_from_mmsi("9999999"),
            Err(KeyError::MmsiReserved {
                mmsi: "9999999".to_string()
            })
        );
    }

    #[test]
    fn mmsi_rejects_non_digit_payload() {
        assert!(matches!(
            EntityKey::vessel_from_mmsi("ABC123"),
            Err(KeyError::MmsiWrongLength { .. })
        ));
    }

    #[test]
    fn aircraft_key_prefers_flight_id_over_registration_and_callsign() {
        let key = EntityKey::aircraft_from(Some("BA123"), Some("G-ABCD"), Some("speedbird")).unwrap();
        assert_eq!(key.id(), "BA123");
    }

    #[test]
    fn aircraft_key_falls_back_to_uppercased_callsign() {
        let key = EntityKey::aircraft_from(None, None, Some(" speedbird1 ")).unwrap();
        assert_eq!(key.id(), "SPEEDBIRD1");
    }

    #[test]
    fn unknown_source_weight_defaults_to_point_eight() {
        assert_eq!(Source::Unknown.default_weight(), 0.8);
    }
}
