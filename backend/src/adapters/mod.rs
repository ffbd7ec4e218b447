//! Ingest adapters: one task per upstream feed, each normalizing its own
//! wire protocol down to the shared `SourceAdapter` contract.

pub mod adsb;
pub mod ais_signalr;
pub mod ais_ws;
pub mod common;

pub use adsb::{AdsbAdapter, AdsbConfig};
pub use ais_signalr::{AisSignalRAdapter, AisSignalRConfig};
pub use ais_ws::{AisWsAdapter, AisWsConfig};
pub use common::{AdapterCounters, AdapterStatus, SourceAdapter};
