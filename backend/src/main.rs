use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use socketioxide::SocketIo;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use axum::http::HeaderValue;
use tracing::{info, warn};

use fusion_backend::adapters::common::SourceAdapter;
use fusion_backend::adapters::{
    AdsbAdapter, AdsbConfig, AisSignalRAdapter, AisSignalRConfig, AisWsAdapter, AisWsConfig,
};
use fusion_backend::backpressure::{self, DropOldestSender};
use fusion_backend::broadcast_gateway::{self, BroadcastGateway};
use fusion_backend::config::{SharedSettings, Settings};
use fusion_backend::dlq::DeadLetterQueue;
use fusion_backend::fusion::{FusionEngine, FusionParams};
use fusion_backend::geo::haversine_m;
use fusion_backend::normalizer;
use fusion_backend::persistence::batch::BatchAccumulator;
use fusion_backend::persistence::{self, PersistenceLayer};
use fusion_backend::pubsub::{Bus, BusEvent};
use fusion_backend::raw::RawMsg;
use fusion_backend::status::{self, FusionCounters, StatusSource};
use fusion_backend::now_ms;

static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

fn env_default(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ── HTTP surface: health + status ───────────────────────────────

async fn health_check() -> axum::Json<serde_json::Value> {
    let now = now_ms();
    let startup = STARTUP_MS.load(Ordering::Relaxed) as i64;
    let uptime_secs = if startup > 0 { (now - startup) / 1000 } else { 0 };
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptimeSecs": uptime_secs,
    }))
}

async fn status_snapshot(State(source): State<Arc<StatusSource>>) -> axum::Json<serde_json::Value> {
    let snapshot = status::snapshot(&source).await;
    axum::Json(serde_json::to_value(snapshot).unwrap_or_default())
}

// ── Fusion orchestrator: ingest → normalize → decide → publish/persist ───

/// One worker out of the fixed-size pool bounding `maxParallelFusion`
/// concurrent persist operations. `rx` is a clone of the shared
/// bounded channel — every worker independently `recv`s from it, so the
/// pool's size is simply how many of these are spawned, not a semaphore
/// wrapped around a single consumer loop. Each message: normalize, ingest
/// into the fusion engine, decide, and on publish, write-through the hot
/// view, queue for batched history, and broadcast on the bus.
#[allow(clippy::too_many_arguments)]
async fn run_fusion_worker(
    mut rx: backpressure::DropOldestReceiver<RawMsg>,
    fusion: Arc<FusionEngine>,
    persistence: Arc<PersistenceLayer>,
    bus: Arc<Bus>,
    dlq: Arc<DeadLetterQueue>,
    settings: SharedSettings,
    counters: Arc<FusionCounters>,
    history_tx: tokio::sync::mpsc::Sender<fusion_types::FusedRecord>,
    reject_stats: Arc<normalizer::RejectStats>,
    seen_keys: Arc<dashmap::DashSet<fusion_types::EntityKey>>,
    cancel: CancellationToken,
) {
    loop {
        // Cancellation is only honored between records: once a record is
        // pulled off the channel it is processed to completion, per the
        // drain requirement. `cancel` wins ties so a cancelled worker
        // doesn't keep picking up fresh work while racing the channel.
        let raw = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            item = rx.recv() => match item {
                Some(raw) => raw,
                None => break,
            },
        };
        counters.normalized.fetch_add(1, Ordering::Relaxed);

        let cfg = settings.get().await;
        let now = now_ms();
        let norm = match normalizer::normalize(&raw, cfg.max_age_ms, now) {
            Ok(m) => m,
            Err(reason) => {
                reject_stats.record(raw.source, &reason, 60_000, now);
                continue;
            }
        };

        let key = norm.key.clone();
        if seen_keys.insert(key.clone()) {
            bus.publish(BusEvent::NewEntity { key: key.to_string() }).await;
        }

        let params = FusionParams {
            window_ms: cfg.window_ms,
            allowed_lateness_ms: cfg.allowed_lateness_ms,
            min_move_meters: cfg.min_move_meters,
            publish_min_interval_ms: cfg.publish_min_interval_ms,
            accept_all: cfg.accept_all,
        };

        fusion.ingest(norm, params, now).await;

        let decision = fusion.decide(&key, params, now).await;
        let Some(best) = decision.best else {
            continue;
        };
        if !decision.publish {
            continue;
        }

        let rec = fusion_types::FusedRecord {
            msg: best.clone(),
            score: decision.score,
            published_at: now,
        };

        fusion.mark_published(&key, best.ts, best.lat, best.lon).await;
        counters.published.fetch_add(1, Ordering::Relaxed);

        bus.publish(BusEvent::PositionUpdate(rec.clone())).await;

        // Read the prior hot-view position before it's overwritten, so the
        // optional history min-move filter can compare against
        // it. `min_position_distance_m == 0.0` (the default) disables the
        // filter outright — every published record reaches history.
        let prior = if cfg.min_position_distance_m > 0.0 {
            persistence.latest_for(&key.to_string()).await.ok().flatten()
        } else {
            None
        };

        match persistence.persist_hot_view(&rec).await {
            Ok(()) => {
                let skip_history = prior
                    .map(|p| {
                        let dist = haversine_m(rec.msg.lat, rec.msg.lon, p.lat, p.lon);
                        let age = rec.msg.ts - p.ts;
                        dist < cfg.min_position_distance_m && age < cfg.max_position_age_ms
                    })
                    .unwrap_or(false);

                if skip_history {
                    continue;
                }

                if let Err(e) = history_tx.send(rec.clone()).await {
                    warn!(error = %e, "history batch channel closed, persisting inline to DLQ");
                    dlq.enqueue(rec, "history queue closed".to_string(), now).await;
                }
            }
            Err(e) => {
                warn!(key = %key, error = %e, "hot view write failed after retry, enqueuing to DLQ");
                dlq.enqueue(rec, e.to_string(), now).await;
            }
        }
    }
}

/// Accumulates published records into a batch and flushes on whichever
/// comes first: `batchSize` or `batchTimeout`. Flush failures
/// enqueue the whole batch to the DLQ individually so one bad record
/// doesn't block the rest.
async fn run_history_batcher(
    mut rx: tokio::sync::mpsc::Receiver<fusion_types::FusedRecord>,
    persistence: Arc<PersistenceLayer>,
    dlq: Arc<DeadLetterQueue>,
    settings: SharedSettings,
    counters: Arc<FusionCounters>,
    cancel: CancellationToken,
) {
    let cfg = settings.get().await;
    let mut batch = BatchAccumulator::new(cfg.batch_size, cfg.batch_timeout_ms);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                // Drain whatever fusion workers already queued before the
                // channel is torn down, then flush once as a final batch.
                while let Ok(rec) = rx.try_recv() {
                    batch.push(rec);
                }
                flush(&mut batch, &persistence, &dlq, &counters).await;
                return;
            }
            maybe_rec = rx.recv() => {
                match maybe_rec {
                    Some(rec) => {
                        if batch.push(rec) {
                            flush(&mut batch, &persistence, &dlq, &counters).await;
                        }
                    }
                    None => {
                        flush(&mut batch, &persistence, &dlq, &counters).await;
                        return;
                    }
                }
            }
            _ = tokio::time::sleep_until(batch.deadline()), if !batch.is_empty() => {
                if batch.timed_out() {
                    flush(&mut batch, &persistence, &dlq, &counters).await;
                }
            }
        }
    }
}

async fn flush(
    batch: &mut BatchAccumulator,
    persistence: &PersistenceLayer,
    dlq: &DeadLetterQueue,
    counters: &FusionCounters,
) {
    if batch.is_empty() {
        return;
    }
    let records = batch.take();
    counters.batches.fetch_add(1, Ordering::Relaxed);
    if let Err(e) = persistence.flush_history(&records).await {
        warn!(error = %e, count = records.len(), "history batch flush failed, enqueuing to DLQ");
        let now = now_ms();
        for rec in records {
            dlq.enqueue(rec, e.to_string(), now).await;
        }
    }
}

/// Periodic retention sweep over the hot view, on a timer rather than a
/// sampling heuristic tied to message volume.
async fn run_retention_sweep(persistence: Arc<PersistenceLayer>, settings: SharedSettings, cancel: CancellationToken) {
    loop {
        let cfg = settings.get().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(60)) => {}
        }
        let now = now_ms();
        match persistence.sweep_retention(now, cfg.retention_ms).await {
            Ok(n) if n > 0 => info!(swept = n, "hot view retention sweep"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "retention sweep failed"),
        }
    }
}

async fn run_dlq_sweep(
    persistence: Arc<PersistenceLayer>,
    dlq: Arc<DeadLetterQueue>,
    bus: Arc<Bus>,
    settings: SharedSettings,
    cancel: CancellationToken,
) {
    loop {
        let cfg = settings.get().await;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_secs(cfg.dlq_retry_interval_s)) => {}
        }
        let escalated = dlq.retry_sweep(&persistence, cfg.dlq_max_retries, cfg.dlq_batch_size).await;
        for entry in escalated {
            bus.publish(BusEvent::RegionAlert {
                key: entry.record.key().to_string(),
                message: format!("history write failed after {} retries: {}", entry.retry_count, entry.reason),
            })
            .await;
        }
    }
}

/// Subscribes to `config:update` and hot-swaps the process-wide `Settings`
/// holder. The admin surface that actually decides new values is an
/// external collaborator (spec §1); this task is the one place in the core
/// that applies whatever it publishes. In-flight fusion windows are kept —
/// only subsequently-ingested messages see the new tunables.
async fn run_config_watcher(bus: Arc<Bus>, settings: SharedSettings, cancel: CancellationToken) {
    let mut rx = bus.subscribe();
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            event = rx.recv() => match event {
                Ok(BusEvent::ConfigUpdate(new_settings)) => {
                    settings.replace(new_settings).await;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "config watcher lagged behind the bus");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
            },
        }
    }
}

fn build_ais_ws_adapter(max_reconnect_attempts: u32, max_batch_bytes: usize) -> AisWsAdapter {
    AisWsAdapter::new(
        "ais-vendor-ws",
        AisWsConfig {
            url: env_default("AIS_WS_URL", "wss://example-ais-vendor.invalid/stream"),
            subscription: json!({
                "type": "subscribe",
                "bbox": [-180.0, -90.0, 180.0, 90.0],
            }),
            max_reconnect_attempts,
            max_batch_bytes,
            idle_timeout: Duration::from_secs(60),
        },
    )
}

fn build_ais_signalr_adapter(max_reconnect_attempts: u32, max_batch_bytes: usize) -> AisSignalRAdapter {
    AisSignalRAdapter::new(
        "ais-signalr",
        AisSignalRConfig {
            url: env_default("AIS_SIGNALR_URL", "wss://example-ais-hub.invalid/hub"),
            hub_protocol: "json".to_string(),
            max_reconnect_attempts,
            max_batch_bytes,
            idle_timeout: Duration::from_secs(60),
        },
    )
}

fn build_adsb_adapter(max_reconnect_attempts: u32, max_batch_bytes: usize) -> AdsbAdapter {
    AdsbAdapter::new(
        "adsb",
        AdsbConfig {
            url: env_default("ADSB_URL", "wss://example-adsb-feed.invalid/stream"),
            subscription: json!({ "type": "subscribe" }),
            max_reconnect_attempts,
            max_batch_bytes,
            idle_timeout: Duration::from_secs(60),
        },
    )
}

#[tokio::main]
async fn main() {
    STARTUP_MS.store(now_ms() as u64, Ordering::Relaxed);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fusion_backend=info,socketioxide=warn".into()),
        )
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "fusion backend starting");

    let settings = Settings::default();
    let shared_settings = SharedSettings::new(settings.clone());

    let redis_url = env_default("HOT_VIEW_REDIS_URL", "redis://127.0.0.1:6379");
    let redis_conn = persistence::hot_view::connect(&redis_url).await.unwrap_or_else(|e| {
        panic!("fatal: could not connect to hot view store at {redis_url}: {e}");
    });
    persistence::hot_view::log_connected(&redis_url);

    let pg_pool = persistence::history::connect_from_env().await.unwrap_or_else(|e| {
        panic!("fatal: could not connect to history database: {e}");
    });
    if let Err(e) = persistence::history::migrate(&pg_pool).await {
        warn!(error = %e, "history schema migration failed or migrations dir absent, continuing");
    }

    let persistence_layer = Arc::new(PersistenceLayer::new(pg_pool, redis_conn, settings.hot_view_ttl_s));

    let cross_process_client = if settings.cross_process {
        redis::Client::open(redis_url.as_str()).ok()
    } else {
        None
    };
    let bus = Arc::new(Bus::new(cross_process_client));

    let fusion_engine = Arc::new(FusionEngine::new());

    let data_dir = PathBuf::from(env_default("FUSION_DATA_DIR", "./data"));
    let _ = tokio::fs::create_dir_all(&data_dir).await;
    let dlq = Arc::new(
        DeadLetterQueue::load(data_dir.join("dlq_pending.jsonl"), data_dir.join("dlq_dead.jsonl")).await,
    );

    let gateway = Arc::new(BroadcastGateway::new());
    let (socket_layer, io) = SocketIo::builder().build_layer();
    broadcast_gateway::wire_socket(io.clone(), gateway.clone());

    let cancel = CancellationToken::new();
    let (raw_tx, raw_rx) = backpressure::channel::<RawMsg>(10_000);

    let reject_stats = Arc::new(normalizer::RejectStats::default());
    let counters = Arc::new(FusionCounters::default());
    let seen_keys = Arc::new(dashmap::DashSet::new());

    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
        Arc::new(build_ais_ws_adapter(settings.max_reconnect_attempts, settings.max_batch_bytes)),
        Arc::new(build_ais_signalr_adapter(settings.max_reconnect_attempts, settings.max_batch_bytes)),
        Arc::new(build_adsb_adapter(settings.max_reconnect_attempts, settings.max_batch_bytes)),
    ];

    let mut tasks = Vec::new();

    for adapter in &adapters {
        let adapter = adapter.clone();
        let tx: DropOldestSender<RawMsg> = raw_tx.clone();
        let cancel = cancel.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = adapter.run(tx, cancel).await {
                warn!(adapter = adapter.name(), error = %e, "adapter exited with a fatal error");
            }
        }));
    }

    let (history_tx, history_rx) = tokio::sync::mpsc::channel(settings.batch_size * 4);

    // Fixed-size fusion worker pool bounding `maxParallelFusion`: every
    // worker clones the same bounded receiver and competes for messages,
    // bounding concurrent decide/persist operations by how many are
    // spawned rather than by a semaphore around a single consumer.
    for _ in 0..settings.max_parallel_fusion.max(1) {
        tasks.push(tokio::spawn(run_fusion_worker(
            raw_rx.clone(),
            fusion_engine.clone(),
            persistence_layer.clone(),
            bus.clone(),
            dlq.clone(),
            shared_settings.clone(),
            counters.clone(),
            history_tx.clone(),
            reject_stats.clone(),
            seen_keys.clone(),
            cancel.clone(),
        )));
    }

    tasks.push(tokio::spawn(run_config_watcher(
        bus.clone(),
        shared_settings.clone(),
        cancel.clone(),
    )));

    // Drop this function's own sender once every worker above holds its
    // own clone, so the batcher's `rx.recv()` can observe channel closure
    // after the last fusion worker exits rather than only ever seeing
    // cancellation.
    drop(history_tx);

    tasks.push(tokio::spawn(run_history_batcher(
        history_rx,
        persistence_layer.clone(),
        dlq.clone(),
        shared_settings.clone(),
        counters.clone(),
        cancel.clone(),
    )));

    tasks.push(tokio::spawn(run_retention_sweep(
        persistence_layer.clone(),
        shared_settings.clone(),
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(run_dlq_sweep(
        persistence_layer.clone(),
        dlq.clone(),
        bus.clone(),
        shared_settings.clone(),
        cancel.clone(),
    )));

    tasks.push(tokio::spawn(broadcast_gateway::run_event_driven_forwarder(
        io.clone(),
        gateway.clone(),
        bus.clone(),
        shared_settings.clone(),
        cancel.clone(),
    )));
    tasks.push(tokio::spawn(broadcast_gateway::run_periodic_tick(
        io.clone(),
        gateway.clone(),
        persistence_layer.clone(),
        shared_settings.clone(),
        bus.clone(),
        cancel.clone(),
    )));

    let status_source = Arc::new(StatusSource {
        adapters: adapters.clone(),
        counters: counters.clone(),
        fusion: fusion_engine.clone(),
        dlq: dlq.clone(),
    });

    let cors_origins_env = env_default("CORS_ORIGINS", "http://localhost:3000,http://localhost:5173");
    let cors = if cors_origins_env.trim() == "*" {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = cors_origins_env
            .split(',')
            .filter_map(|o| o.trim().parse::<HeaderValue>().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status_snapshot))
        .with_state(status_source)
        .layer(socket_layer)
        .layer(cors);

    let port = env_default("PORT", "3001");
    let addr = format!("0.0.0.0:{port}");
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();

    let shutdown_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received, draining");
            shutdown_cancel.cancel();
        })
        .await
        .unwrap();

    // The HTTP listener has stopped accepting new connections; cancel
    // every background task too (a no-op if ctrl_c already did it above)
    // and wait for them to drain in-flight work — including the fusion
    // workers' current record and the history batcher's final flush —
    // before the process exits.
    cancel.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "background task panicked during shutdown");
        }
    }
    info!("shutdown complete");
}
