//! Shared adapter scaffolding: the `SourceAdapter` contract, status
//! counters, and the exponential-backoff reconnect loop every adapter runs
//! its upstream connection through.
//!
//! Grounded in the unified ingest command's per-source health structs and
//! stats-reporting task (hut8-soar `commands::ingest`), generalized to a
//! single trait the three concrete adapters implement identically.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fusion_types::Source;

use crate::raw::RawMsg;

/// Counters and liveness state exposed by `SourceAdapter::status`. Cloned
/// into the status snapshot endpoint.
#[derive(Debug, Default, Serialize)]
pub struct AdapterStatus {
    pub name: String,
    pub connected: bool,
    pub dormant: bool,
    pub last_message_at: Option<i64>,
    pub frames_received: u64,
    pub parse_errors: u64,
    pub reconnect_attempts: u32,
}

/// Shared, cheaply-cloned counters an adapter updates from its connection
/// loop and reads back out for `status()`.
#[derive(Default)]
pub struct AdapterCounters {
    pub frames_received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub reconnect_attempts: AtomicU32,
    pub connected: std::sync::atomic::AtomicBool,
    pub dormant: std::sync::atomic::AtomicBool,
    pub last_message_at: AtomicU64,
}

impl AdapterCounters {
    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        let now = chrono::Utc::now().timestamp_millis() as u64;
        self.last_message_at.store(now, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, name: &str) -> AdapterStatus {
        let last = self.last_message_at.load(Ordering::Relaxed);
        AdapterStatus {
            name: name.to_string(),
            connected: self.connected.load(Ordering::Relaxed),
            dormant: self.dormant.load(Ordering::Relaxed),
            last_message_at: if last == 0 { None } else { Some(last as i64) },
            frames_received: self.frames_received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
        }
    }
}

/// Contract every ingress adapter satisfies: start pushing `RawMsg` onto the
/// channel, report status on demand, stop on cancellation.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn name(&self) -> &str;
    fn source(&self) -> Source;

    /// Run the adapter's connection loop until `cancel` fires. Never
    /// returns an `Err` for per-message problems — only for a fatal setup
    /// failure the orchestrator should know about immediately.
    async fn run(&self, tx: crate::backpressure::DropOldestSender<RawMsg>, cancel: CancellationToken) -> anyhow::Result<()>;

    fn status(&self) -> AdapterStatus;
}

/// Exponential backoff capped at 60s, giving up (entering `Dormant`) after
/// `max_attempts` consecutive failures. A successful `open` resets the
/// counter via `ReconnectLoop::reset`.
pub struct ReconnectLoop {
    attempt: u32,
    max_attempts: u32,
    base: Duration,
    cap: Duration,
}

impl ReconnectLoop {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(60),
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn is_dormant(&self) -> bool {
        self.attempt >= self.max_attempts
    }

    /// Sleep for the current backoff duration (full jitter) and advance the
    /// attempt counter. Returns `false` once `max_attempts` is reached —
    /// callers should stop trying and report `dormant`.
    pub async fn wait(&mut self) -> bool {
        if self.is_dormant() {
            return false;
        }
        self.attempt += 1;
        let exp = self.base.saturating_mul(1 << self.attempt.min(8));
        let capped = exp.min(self.cap);
        let jittered = {
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(0..=capped.as_millis() as u64))
        };
        warn!(attempt = self.attempt, delay_ms = jittered.as_millis(), "reconnect backoff");
        tokio::time::sleep(jittered).await;
        true
    }
}

/// Lightweight EWMA used for the periodic receive-rate log line, grounded
/// in the unified ingest command's stats task.
pub struct Ewma {
    half_life_secs: f64,
    value: f64,
    initialized: bool,
}

impl Ewma {
    pub fn new(half_life_secs: f64) -> Self {
        Self {
            half_life_secs,
            value: 0.0,
            initialized: false,
        }
    }

    pub fn update(&mut self, sample: f64, window_secs: f64) {
        if !self.initialized {
            self.value = sample;
            self.initialized = true;
            return;
        }
        let alpha = 1.0 - (-window_secs * std::f64::consts::LN_2 / self.half_life_secs).exp();
        self.value += alpha * (sample - self.value);
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

pub fn log_adapter_started(name: &str, endpoint: &str) {
    info!(adapter = name, endpoint, "adapter starting");
}

pub type SharedCounters = Arc<AdapterCounters>;

/// Periodic one-line stats summary, every 30s, for as long as `cancel` is
/// open. Logs the EWMA-smoothed receive rate rather than the raw 30s
/// count so a single bursty or quiet interval doesn't swing the reported
/// rate — grounded in the unified ingest command's stats task.
pub async fn run_stats_task(name: String, counters: SharedCounters, cancel: CancellationToken) {
    const INTERVAL_SECS: f64 = 30.0;
    let mut ewma = Ewma::new(60.0);
    let mut last_frames = counters.frames_received.load(Ordering::Relaxed);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs_f64(INTERVAL_SECS)) => {}
        }

        let frames = counters.frames_received.load(Ordering::Relaxed);
        let delta = frames.saturating_sub(last_frames);
        last_frames = frames;
        ewma.update(delta as f64 / INTERVAL_SECS, INTERVAL_SECS);

        info!(
            adapter = %name,
            rate_per_sec = format!("{:.2}", ewma.value()),
            total_frames = frames,
            parse_errors = counters.parse_errors.load(Ordering::Relaxed),
            "adapter receive-rate stats"
        );
    }
}
