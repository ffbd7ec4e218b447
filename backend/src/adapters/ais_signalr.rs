//! SignalR-style AIS hub adapter.
//!
//! The vendor hub speaks the ASP.NET SignalR JSON protocol over a plain
//! WebSocket: a one-time text handshake terminated by the record separator
//! `\x1e`, followed by a stream of record-separator-terminated JSON
//! envelopes. Invocation envelopes with `target == "QueryData"` carry the
//! vessel rows we care about, one JSON object per row, in varied casing
//! (`MMSI` / `Mmsi` / `mmsi`) that the normalizer is responsible for
//! reconciling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fusion_types::Source;

use crate::adapters::common::{self, AdapterCounters, AdapterStatus, ReconnectLoop, SharedCounters, SourceAdapter};
use crate::raw::RawMsg;

const RECORD_SEPARATOR: char = '\u{1e}';

pub struct AisSignalRConfig {
    pub url: String,
    pub hub_protocol: String,
    pub max_reconnect_attempts: u32,
    pub max_batch_bytes: usize,
    pub idle_timeout: Duration,
}

pub struct AisSignalRAdapter {
    name: String,
    config: AisSignalRConfig,
    counters: SharedCounters,
}

impl AisSignalRAdapter {
    pub fn new(name: impl Into<String>, config: AisSignalRConfig) -> Self {
        Self {
            name: name.into(),
            config,
            counters: Arc::new(AdapterCounters::default()),
        }
    }

    fn handshake_payload(&self) -> String {
        let handshake = serde_json::json!({
            "protocol": self.config.hub_protocol,
            "version": 1,
        });
        format!("{}{}", handshake, RECORD_SEPARATOR)
    }
}

#[async_trait]
impl SourceAdapter for AisSignalRAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> Source {
        Source::AisSignalR
    }

    async fn run(&self, tx: crate::backpressure::DropOldestSender<RawMsg>, cancel: CancellationToken) -> anyhow::Result<()> {
        common::log_adapter_started(&self.name, &self.config.url);
        let stats_task = tokio::spawn(common::run_stats_task(
            self.name.clone(),
            self.counters.clone(),
            cancel.clone(),
        ));

        let mut backoff = ReconnectLoop::new(self.config.max_reconnect_attempts);

        let result = loop {
            if cancel.is_cancelled() {
                break Ok(());
            }

            match self.connect_and_stream(&tx, &cancel, &mut backoff).await {
                Ok(()) => break Ok(()),
                Err(e) => {
                    self.counters
                        .connected
                        .store(false, std::sync::atomic::Ordering::Relaxed);
                    warn!(adapter = %self.name, error = %e, "hub connection lost");
                    self.counters
                        .reconnect_attempts
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if !backoff.wait().await {
                        self.counters
                            .dormant
                            .store(true, std::sync::atomic::Ordering::Relaxed);
                        warn!(adapter = %self.name, "max reconnect attempts reached, entering dormant state");
                        break Ok(());
                    }
                }
            }
        };

        let _ = stats_task.await;
        result
    }

    fn status(&self) -> AdapterStatus {
        self.counters.snapshot(&self.name)
    }
}

impl AisSignalRAdapter {
    async fn connect_and_stream(
        &self,
        tx: &crate::backpressure::DropOldestSender<RawMsg>,
        cancel: &CancellationToken,
        backoff: &mut ReconnectLoop,
    ) -> anyhow::Result<()> {
        info!(adapter = %self.name, url = %self.config.url, "connecting");
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.url).await?;
        let (mut write, mut read) = ws_stream.split();

        write.send(Message::Text(self.handshake_payload())).await?;

        // First frame back is the handshake response (`{}`, RS-terminated).
        match tokio::time::timeout(self.config.idle_timeout, read.next()).await {
            Ok(Some(Ok(Message::Text(_)))) => {}
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(None) => return Err(anyhow::anyhow!("hub closed before handshake ack")),
            Err(_) => return Err(anyhow::anyhow!("timed out waiting for handshake ack")),
        }

        self.counters
            .connected
            .store(true, std::sync::atomic::Ordering::Relaxed);
        self.counters
            .dormant
            .store(false, std::sync::atomic::Ordering::Relaxed);
        backoff.reset();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                next = tokio::time::timeout(self.config.idle_timeout, read.next()) => {
                    let frame = match next {
                        Ok(Some(Ok(frame))) => frame,
                        Ok(Some(Err(e))) => return Err(e.into()),
                        Ok(None) => return Err(anyhow::anyhow!("hub closed the stream")),
                        Err(_) => return Err(anyhow::anyhow!("idle timeout waiting for hub frame")),
                    };
                    self.handle_frame(frame, tx).await;
                }
            }
        }
    }

    async fn handle_frame(&self, frame: Message, tx: &crate::backpressure::DropOldestSender<RawMsg>) {
        let text = match frame {
            Message::Text(t) if t.len() <= self.config.max_batch_bytes => t,
            Message::Text(t) => {
                warn!(adapter = %self.name, size = t.len(), "oversize batch, truncating");
                super::ais_ws::truncate_to_char_boundary(&t, self.config.max_batch_bytes)
            }
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Binary(_) | Message::Frame(_) => {
                return
            }
        };

        let received_at = chrono::Utc::now().timestamp_millis();

        for envelope in text.split(RECORD_SEPARATOR).filter(|s| !s.is_empty()) {
            let value: Value = match serde_json::from_str(envelope) {
                Ok(v) => v,
                Err(e) => {
                    debug!(adapter = %self.name, error = %e, "malformed envelope, dropping");
                    self.counters.record_parse_error();
                    continue;
                }
            };

            // Keepalive pings have no `type`/`target`; only forward
            // invocation messages (type 1) addressed to QueryData.
            let target = value.get("target").and_then(Value::as_str);
            if target != Some("QueryData") {
                continue;
            }
            let Some(args) = value.get("arguments").and_then(Value::as_array) else {
                continue;
            };

            for arg in args {
                let rows: Vec<Value> = match arg {
                    Value::Array(items) => items.clone(),
                    single => vec![single.clone()],
                };
                for payload in rows {
                    self.counters.record_frame();
                    let msg = RawMsg {
                        source: Source::AisSignalR,
                        received_at,
                        payload,
                    };
                    tx.send(msg).await;
                }
            }
        }
    }
}
