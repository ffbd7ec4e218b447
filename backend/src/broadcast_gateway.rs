//! Realtime subscriber layer. Tracks each socket's declared viewport and
//! per-entity last-sent dedupe state, and pushes filtered `positionUpdate`
//! events on a periodic tick plus an event-driven path between ticks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use socketioxide::extract::{Data, SocketRef};
use socketioxide::SocketIo;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fusion_types::{EntityKey, FusedRecord};

use crate::config::SharedSettings;
use crate::geo::{haversine_m, Viewport};
use crate::persistence::PersistenceLayer;
use crate::pubsub::{Bus, BusEvent};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Debug, Clone, Copy)]
struct LastSent {
    ts: i64,
    lat: f64,
    lon: f64,
}

struct ClientState {
    viewport: Viewport,
    last_sent: HashMap<String, LastSent>,
}

#[derive(Debug, Deserialize)]
struct SubscribeViewport {
    bbox: [f64; 4],
}

#[derive(Debug, Serialize)]
struct PositionUpdatePayload<'a> {
    key: &'a str,
    lat: f64,
    lon: f64,
    ts: i64,
    speed: Option<f64>,
    course: Option<f64>,
    heading: Option<f64>,
    status: Option<&'a str>,
    source: &'a str,
    score: f64,
}

/// Owns per-client viewport and last-sent dedupe state, keyed by socket id.
pub struct BroadcastGateway {
    clients: DashMap<String, ClientState>,
}

impl BroadcastGateway {
    pub fn new() -> Self {
        Self {
            clients: DashMap::new(),
        }
    }

    pub fn register(&self, socket_id: &str) {
        self.clients.insert(
            socket_id.to_string(),
            ClientState {
                viewport: Viewport::from_bbox([-180.0, -90.0, 180.0, 90.0]),
                last_sent: HashMap::new(),
            },
        );
    }

    pub fn deregister(&self, socket_id: &str) {
        self.clients.remove(socket_id);
    }

    pub fn update_viewport(&self, socket_id: &str, bbox: [f64; 4]) {
        if let Some(mut state) = self.clients.get_mut(socket_id) {
            state.viewport = Viewport::from_bbox(bbox);
        }
    }

    /// Apply the per-client dedupe gate and, if it passes, update
    /// `last_sent` and emit. Used by both the periodic tick and the
    /// event-driven path so the two share one gate.
    fn maybe_push(
        &self,
        io: &SocketIo,
        socket_id: &str,
        key: &EntityKey,
        rec: &FusedRecord,
        min_client_move_meters: f64,
        client_keepalive_ms: i64,
    ) {
        self.maybe_push_fields(
            io,
            socket_id,
            &key.to_string(),
            rec.msg.lat,
            rec.msg.lon,
            rec.msg.ts,
            rec.msg.speed,
            rec.msg.course,
            rec.msg.heading,
            rec.msg.status.as_deref(),
            rec.msg.source.id_str(),
            rec.score,
            min_client_move_meters,
            client_keepalive_ms,
        );
    }

    /// Same gate and emit as [`Self::maybe_push`], but sourced from the hot
    /// view's plain fields rather than a freshly-published `FusedRecord` —
    /// used by the periodic tick, which walks the active set rather than
    /// reacting to a bus event.
    #[allow(clippy::too_many_arguments)]
    fn maybe_push_fields(
        &self,
        io: &SocketIo,
        socket_id: &str,
        key_str: &str,
        lat: f64,
        lon: f64,
        ts: i64,
        speed: Option<f64>,
        course: Option<f64>,
        heading: Option<f64>,
        status: Option<&str>,
        source: &str,
        score: f64,
        min_client_move_meters: f64,
        client_keepalive_ms: i64,
    ) {
        let Some(mut state) = self.clients.get_mut(socket_id) else {
            return;
        };

        if !state.viewport.contains(lat, lon) {
            return;
        }

        let should_push = match state.last_sent.get(key_str) {
            None => true,
            Some(last) => {
                let newer = ts > last.ts;
                let moved_enough = haversine_m(lat, lon, last.lat, last.lon) >= min_client_move_meters;
                let kept_alive = ts - last.ts >= client_keepalive_ms;
                newer && (moved_enough || kept_alive)
            }
        };

        if !should_push {
            return;
        }

        let payload = PositionUpdatePayload {
            key: key_str,
            lat,
            lon,
            ts,
            speed,
            course,
            heading,
            status,
            source,
            score,
        };

        match io.to(socket_id.to_string()).emit("positionUpdate", &payload) {
            Ok(_) => {
                state.last_sent.insert(key_str.to_string(), LastSent { ts, lat, lon });
            }
            Err(e) => {
                warn!(socket = socket_id, error = %e, "send failed, dropping this subscriber's state");
                drop(state);
                self.clients.remove(socket_id);
            }
        }
    }

    fn socket_ids(&self) -> Vec<String> {
        self.clients.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for BroadcastGateway {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers connection handlers: `subscribeViewport`, `updateViewport`,
/// `ping`. Disconnect cleanup removes the client's state entirely.
pub fn wire_socket(io: SocketIo, gateway: Arc<BroadcastGateway>) {
    io.ns("/", move |socket: SocketRef| {
        let gateway = gateway.clone();
        async move {
            let socket_id = socket.id.to_string();
            info!(socket = %socket_id, "client connected");
            gateway.register(&socket_id);

            socket.on_disconnect({
                let gateway = gateway.clone();
                let socket_id = socket_id.clone();
                move |_: SocketRef| {
                    let gateway = gateway.clone();
                    let socket_id = socket_id.clone();
                    async move {
                        gateway.deregister(&socket_id);
                        info!(socket = %socket_id, "client disconnected");
                    }
                }
            });

            {
                let gateway = gateway.clone();
                let socket_id = socket_id.clone();
                socket.on("subscribeViewport", move |Data::<SubscribeViewport>(data)| {
                    let gateway = gateway.clone();
                    let socket_id = socket_id.clone();
                    async move {
                        gateway.update_viewport(&socket_id, data.bbox);
                    }
                });
            }

            {
                let gateway = gateway.clone();
                let socket_id = socket_id.clone();
                socket.on("updateViewport", move |Data::<SubscribeViewport>(data)| {
                    let gateway = gateway.clone();
                    let socket_id = socket_id.clone();
                    async move {
                        gateway.update_viewport(&socket_id, data.bbox);
                    }
                });
            }

            {
                socket.on("ping", move |s: SocketRef| async move {
                    let _ = s.emit("pong", &());
                });
            }
        }
    });
}

/// Event-driven path: forward each `positionUpdate` bus event to every
/// connected client immediately, subject to the same dedupe gate as the
/// periodic tick.
pub async fn run_event_driven_forwarder(
    io: SocketIo,
    gateway: Arc<BroadcastGateway>,
    bus: Arc<Bus>,
    settings: SharedSettings,
    cancel: CancellationToken,
) {
    let mut rx = bus.subscribe();
    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            received = rx.recv() => received,
        };
        match received {
            Ok(BusEvent::PositionUpdate(rec)) => {
                let cfg = settings.get().await;
                for socket_id in gateway.socket_ids() {
                    gateway.maybe_push(
                        &io,
                        &socket_id,
                        rec.key(),
                        &rec,
                        cfg.min_client_move_meters,
                        cfg.client_keepalive_ms,
                    );
                }
            }
            Ok(BusEvent::NewEntity { key }) => {
                if let Err(e) = io.emit("newEntity", &serde_json::json!({ "key": key })) {
                    warn!(error = %e, "newEntity emit failed");
                }
            }
            Ok(BusEvent::ConfigUpdate(settings)) => {
                if let Err(e) = io.emit("configUpdate", &settings) {
                    warn!(error = %e, "configUpdate emit failed");
                }
            }
            Ok(BusEvent::ConnectionStats { connected_clients, active_entities }) => {
                let payload = serde_json::json!({
                    "connectedClients": connected_clients,
                    "activeEntities": active_entities,
                });
                if let Err(e) = io.emit("connectionStats", &payload) {
                    warn!(error = %e, "connectionStats emit failed");
                }
            }
            Ok(BusEvent::RegionAlert { key, message }) => {
                let payload = serde_json::json!({ "key": key, "message": message });
                if let Err(e) = io.emit("regionAlert", &payload) {
                    warn!(error = %e, "regionAlert emit failed");
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "broadcast gateway forwarder lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Periodic tick (default 5s): snapshot active keys from the hot view,
/// filter per client viewport, push through the dedupe gate.
pub async fn run_periodic_tick(
    io: SocketIo,
    gateway: Arc<BroadcastGateway>,
    persistence: Arc<PersistenceLayer>,
    settings: SharedSettings,
    bus: Arc<Bus>,
    cancel: CancellationToken,
) {
    loop {
        let cfg = settings.get().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_millis(cfg.broadcast_interval_ms)) => {}
        }

        let now = now_ms();
        let active = match persistence.active_keys_since(now, cfg.stale_cutoff_ms).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(error = %e, "could not snapshot active keys for broadcast tick");
                continue;
            }
        };

        let socket_ids = gateway.socket_ids();
        bus.publish(BusEvent::ConnectionStats {
            connected_clients: socket_ids.len(),
            active_entities: active.len(),
        })
        .await;

        if active.is_empty() || socket_ids.is_empty() {
            continue;
        }

        let mut candidates = 0u64;

        for key_str in &active {
            let latest = match persistence.latest_for(key_str).await {
                Ok(Some(l)) => l,
                Ok(None) => continue,
                Err(e) => {
                    warn!(key = %key_str, error = %e, "could not read hot view latest for broadcast tick");
                    continue;
                }
            };

            for socket_id in &socket_ids {
                gateway.maybe_push_fields(
                    &io,
                    socket_id,
                    key_str,
                    latest.lat,
                    latest.lon,
                    latest.ts,
                    latest.speed,
                    latest.course,
                    latest.heading,
                    latest.status.as_deref(),
                    &latest.source,
                    latest.score,
                    cfg.min_client_move_meters,
                    cfg.client_keepalive_ms,
                );
                candidates += 1;
            }
        }

        info!(keys = active.len(), clients = socket_ids.len(), candidates, "broadcast tick");
    }
}
