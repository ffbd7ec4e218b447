//! AIS vendor WebSocket adapter.
//!
//! Connects to a single vendor WebSocket endpoint, sends a one-time JSON
//! subscription payload (bounding box + message-type filter), and
//! decodes incoming frames — which may be a single JSON object or a JSON
//! array of objects — into `RawMsg`s tagged `Source::AisVendorWs`.

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

pub struct AisWsConfig {
    pub url: String,
    pub subscription: Value,
    pub max_reconnect_attempts: u32,
    pub max_batch_bytes: usize,
    pub idle_timeout: Duration,
}

pub struct AisWsAdapter {
    name: String,
    config: AisWsConfig,
    counters: SharedCounters,
}

impl AisWsAdapter {
    pub fn new(name: impl Into<String>, config: AisWsConfig) -> Self {
        Self {
            name: name.into(),
            config,
            counters: Arc::new(AdapterCounters::default()),
        }
    }
}

#[async_trait]
impl SourceAdapter for AisWsAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn source(&self) -> Source {
        Source::AisVendorWs
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
                Ok(()) => {
                    // Clean shutdown requested by caller.
                    break Ok(());
                }
                Err(e) => {
                    self.counters
                        .connected
                        .store(false, std::sync::atomic::Ordering::Relaxed);
                    warn!(adapter = %self.name, error = %e, "upstream connection lost");
                    self.counters.reconnect_attempts.fetch_add(
                        1,
                        std::sync::atomic::Ordering::Relaxed,
                    );
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

impl AisWsAdapter {
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
        // Open succeeded: consecutive-failure count resets here, not on
        // the eventual return from this loop — a long healthy session
        // never climbs toward `max_reconnect_attempts`.
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
                truncate_to_char_boundary(&t, self.config.max_batch_bytes)
            }
            Message::Binary(b) if b.len() <= self.config.max_batch_bytes => {
                String::from_utf8_lossy(&b).to_string()
            }
            Message::Binary(b) => {
                warn!(adapter = %self.name, size = b.len(), "oversize batch, truncating");
                String::from_utf8_lossy(&truncate_bytes_to_char_boundary(&b, self.config.max_batch_bytes)).to_string()
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
        let records: Vec<Value> = match value {
            Value::Array(items) => items,
            single => vec![single],
        };

        for payload in records {
            self.counters.record_frame();
            let msg = RawMsg {
                source: Source::AisVendorWs,
                received_at,
                payload,
            };
            tx.send(msg).await;
        }
    }
}

/// Truncates a string to at most `max_bytes`, falling back to the nearest
/// valid UTF-8 boundary rather than panicking on a byte offset that lands
/// mid-codepoint.
pub(crate) fn truncate_to_char_boundary(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    String::from_utf8_lossy(&s.as_bytes()[..max_bytes]).to_string()
}

/// Same boundary-safe truncation as [`truncate_to_char_boundary`], but for
/// a raw byte buffer (the `Binary` frame path) rather than a `String`
/// already known to be valid UTF-8.
pub(crate) fn truncate_bytes_to_char_boundary(bytes: &[u8], max_bytes: usize) -> Vec<u8> {
    if bytes.len() <= max_bytes {
        return bytes.to_vec();
    }
    let mut end = max_bytes;
    while end > 0 && (bytes[end] & 0xC0) == 0x80 {
        end -= 1;
    }
    bytes[..end].to_vec()
}
