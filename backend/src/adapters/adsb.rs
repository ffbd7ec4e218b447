//! ADS-B / flight feed WebSocket adapter.
//!
//! Structurally identical to [`super::ais_ws`] — a JSON-over-WebSocket feed,
//! single objects or arrays — but kept as its own adapter type because the
//! upstream aircraft feed uses a distinct subscription handshake and field
//! set (`hex`/`icao`, `flight`, `lat`/`lon`, `track`) that the normalizer
//! dispatches on `Source::Adsb`.

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

pub struct AdsbConfig {
    pub url: String,
    pub subscription: Value,
    pub max_reconnect_attempts: u32,
    pub max_batch_bytes: usize,
    pub idle_timeout: Duration,
}

pub struct AdsbAdapter {
    name: String,
    config: AdsbConfig,
    counters: SharedCounters,
}

impl AdsbAdapter {
    pub fn new(name: impl Into<String>, config: AdsbConfig) -> Self {
        Self {
            name: name.into(),
            config,
            counters: Arc::new(AdapterCounters::default()),
        }
    }
}

#[async_trait]
impl SourceAdapter for AdsbAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> Source {
        Source::Adsb
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
                    warn!(adapter = %self.name, error = %e, "upstream connection lost");
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

impl AdsbAdapter {
    async fn connect_and_stream(
        &self,
        tx: &crate::backpressure::DropOldestSender<RawMsg>,
        cancel: &CancellationToken,
        backoff: &mut ReconnectLoop,
    ) -> anyhow::Result<()> {
        info!(adapter = %self.name, url = %self.config.url, "connecting");
        let (ws_stream, _) = tokio_tungstenite::connect_async(&self.config.url).await?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(Message::Text(self.config.subscription.to_string()))
            .await?;

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
                        Ok(None) => return Err(anyhow::anyhow!("upstream closed the stream")),
                        Err(_) => return Err(anyhow::anyhow!("idle timeout waiting for upstream frame")),
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
            Message::Binary(b) if b.len() <= self.config.max_batch_bytes => {
                String::from_utf8_lossy(&b).to_string()
            }
            Message::Binary(b) => {
                warn!(adapter = %self.name, size = b.len(), "oversize batch, truncating");
                String::from_utf8_lossy(&super::ais_ws::truncate_bytes_to_char_boundary(&b, self.config.max_batch_bytes)).to_string()
            }
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => return,
        };

        let value: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(e) => {
                debug!(adapter = %self.name, error = %e, "malformed payload, dropping");
                self.counters.record_parse_error();
                return;
            }
        };

        let received_at = chrono::Utc::now().timestamp_millis();

        // Some feeds wrap the row list under an `aircraft` key; accept both
        // shapes the same way the vendor AIS adapter accepts bare arrays.
        let records: Vec<Value> = match value {
            Value::Array(items) => items,
            Value::Object(ref map) if map.contains_key("aircraft") => map["aircraft"]
                .as_array()
                .cloned()
                .unwrap_or_default(),
            single => vec![single],
        };

        for payload in records {
            self.counters.record_frame();
            let msg = RawMsg {
                source: Source::Adsb,
                received_at,
                payload,
            };
            tx.send(msg).await;
        }
    }
}
