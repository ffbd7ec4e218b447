//! Publish/subscribe bus. In-process delivery is a
//! `tokio::sync::broadcast` channel per named channel; cross-process
//! delivery, when enabled, mirrors publishes through a Redis channel of the
//! same name.
//!
//! Handlers are expected to be non-blocking; a subscriber that falls behind
//! has old messages dropped rather than stalling the publisher — the
//! bounded, drop-oldest semantics `broadcast::Sender` already provides.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

use fusion_types::FusedRecord;

use crate::config::Settings;

pub const CHANNEL_POSITION_UPDATE: &str = "entity:position:update";
pub const CHANNEL_NEW_ENTITY: &str = "entity:new";
pub const CHANNEL_CONFIG_UPDATE: &str = "config:update";
pub const CHANNEL_CONNECTION_STATS: &str = "gateway:connection:stats";
pub const CHANNEL_REGION_ALERT: &str = "entity:region:alert";

const CHANNEL_CAPACITY: usize = 4_096;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum BusEvent {
    #[serde(rename = "positionUpdate")]
    PositionUpdate(FusedRecord),
    #[serde(rename = "newEntity")]
    NewEntity { key: String },
    #[serde(rename = "configUpdate")]
    ConfigUpdate(Settings),
    /// Connected-client and active-entity counts, emitted once per
    /// broadcast gateway tick.
    #[serde(rename = "connectionStats")]
    ConnectionStats {
        connected_clients: usize,
        active_entities: usize,
    },
    /// An operational alert tied to one entity — currently emitted when a
    /// DLQ entry exhausts its retries and is escalated to the dead queue.
    #[serde(rename = "regionAlert")]
    RegionAlert { key: String, message: String },
}

/// In-process fan-out bus. One `broadcast::Sender` shared by every channel
/// name simplifies wiring at the cost of subscribers filtering by variant;
/// cheap at this message volume.
pub struct Bus {
    tx: broadcast::Sender<BusEvent>,
    cross_process: Option<redis::Client>,
}

impl Bus {
    pub fn new(cross_process: Option<redis::Client>) -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx, cross_process }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    pub async fn publish(&self, event: BusEvent) {
        // broadcast::Sender::send only errors when there are zero
        // receivers, which is a legitimate (not exceptional) state here.
        let _ = self.tx.send(event.clone());

        if let Some(client) = &self.cross_process {
            if let Err(e) = self.publish_cross_process(client, &event).await {
                warn!(error = %e, "cross-process publish failed");
            }
        }
    }

    async fn publish_cross_process(
        &self,
        client: &redis::Client,
        event: &BusEvent,
    ) -> Result<(), redis::RedisError> {
        use redis::AsyncCommands;
        let channel = match event {
            BusEvent::PositionUpdate(_) => CHANNEL_POSITION_UPDATE,
            BusEvent::NewEntity { .. } => CHANNEL_NEW_ENTITY,
            BusEvent::ConfigUpdate(_) => CHANNEL_CONFIG_UPDATE,
            BusEvent::ConnectionStats { .. } => CHANNEL_CONNECTION_STATS,
            BusEvent::RegionAlert { .. } => CHANNEL_REGION_ALERT,
        };
        let payload = serde_json::to_string(event).unwrap_or_default();
        let mut conn = client.get_multiplexed_async_connection().await?;
        conn.publish(channel, payload).await
    }
}
