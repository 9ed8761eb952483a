/// Server Orchestrator
///
/// Owns the application context (replacing any notion of a global state
/// table), wires the ingestion workers, the DB writer, the pollers and the
/// WebSocket hub together, runs the periodic task set, and serves the
/// HTTP/WS endpoints until shutdown.

use axum::{routing::get, Extension, Router};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tower_http::cors::{Any, CorsLayer};

use crate::alerts::AlertManager;
use crate::analytics::AnalyticsEngine;
use crate::anomaly::AnomalyDetector;
use crate::api_client::{build_api_clients, NodeApiClient};
use crate::config;
use crate::db;
use crate::db_writer::{self, DbCommand, DbHandle};
use crate::earnings::{self, FinancialTracker};
use crate::geoip::{GeoIpService, NullResolver};
use crate::ingest;
use crate::log_source::ClientGate;
use crate::metrics;
use crate::node_state::{NodeRegistry, NodeState};
use crate::notifications::NotificationHandler;
use crate::performance;
use crate::stats::{view_key, IncrementalStats};
use crate::storage;
use crate::types::{iso_micros, BoxError, NodeConfig};
use crate::websocket::{self, WsHub};

/// Baselines are refreshed this often from historical data
const BASELINE_UPDATE_INTERVAL: Duration = Duration::from_secs(24 * 3600);
/// Total time allowed for a clean shutdown
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

/// Per-view incremental statistics plus the payload cache the broadcaster
/// consults on view changes.
pub struct StatsCenter {
    views: Mutex<HashMap<String, IncrementalStats>>,
    payload_cache: Mutex<HashMap<String, Value>>,
}

impl StatsCenter {
    pub fn new() -> Self {
        Self {
            views: Mutex::new(HashMap::new()),
            payload_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Most recent payload for a view, if one was ever computed
    pub async fn cached_payload(&self, view: &[String]) -> Option<Value> {
        self.payload_cache.lock().await.get(&view_key(view)).cloned()
    }

    /// Catch the view's running stats up with each node's ring, then build
    /// a fresh payload and cache it.
    pub async fn compute_payload(&self, view: &[String], ctx: &AppContext) -> Value {
        let node_names = ctx.resolve_view(view);
        let key = view_key(view);

        let mut views = self.views.lock().await;
        let stats = views.entry(key.clone()).or_insert_with(IncrementalStats::new);

        let mut window_events = Vec::new();
        for name in &node_names {
            if let Some(state) = ctx.nodes.get(name) {
                let last = stats.last_processed.get(name).copied().unwrap_or(0);
                let (fresh, mark) = state.events_since(last).await;
                for event in &fresh {
                    stats.add_event(event);
                }
                stats.last_processed.insert(name.clone(), mark);
                window_events.extend(state.snapshot().await);
            }
        }
        stats.update_live_stats(&window_events);

        let db_path = ctx.db.db_path.clone();
        let hist_nodes = node_names.clone();
        let historical = tokio::task::spawn_blocking(move || {
            db::get_historical_stats(&db_path, &hist_nodes, config::historical_hours_to_show())
        })
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();

        let payload = stats.to_payload(historical);
        drop(views);

        self.payload_cache.lock().await.insert(key, payload.clone());
        payload
    }
}

impl Default for StatsCenter {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the server's components share, owned here and passed
/// explicitly - no process-global state table.
pub struct AppContext {
    pub nodes: NodeRegistry,
    pub node_names: Vec<String>,
    pub hub: Arc<WsHub>,
    pub db: DbHandle,
    pub stats: Arc<StatsCenter>,
    pub alerts: Arc<AlertManager>,
    pub analytics: Arc<AnalyticsEngine>,
    pub anomaly: Arc<AnomalyDetector>,
    pub trackers: HashMap<String, Arc<FinancialTracker>>,
    pub api_clients: HashMap<String, Arc<NodeApiClient>>,
}

impl AppContext {
    /// Expand a view selection to concrete node names
    pub fn resolve_view(&self, view: &[String]) -> Vec<String> {
        if view.iter().any(|v| v == "Aggregate") {
            self.node_names.clone()
        } else {
            view.iter()
                .filter(|name| self.nodes.contains_key(*name))
                .cloned()
                .collect()
        }
    }

    /// Union of the live windows of every node in the view
    pub async fn events_for_view(
        &self,
        view: &[String],
    ) -> Vec<Arc<crate::types::TrafficEvent>> {
        let mut events = Vec::new();
        for name in self.resolve_view(view) {
            if let Some(state) = self.nodes.get(&name) {
                events.extend(state.snapshot().await);
            }
        }
        events
    }

    /// `active_compactions_update` frame for a view
    pub async fn active_compactions_payload(&self, view: &[String]) -> Value {
        let mut compactions = Vec::new();
        for name in self.resolve_view(view) {
            if let Some(state) = self.nodes.get(&name) {
                for (key, started) in state.active_compactions().await {
                    compactions.push(json!({
                        "node_name": key.node_name,
                        "satellite": key.satellite,
                        "store": key.store,
                        "start_iso": iso_micros(&started),
                    }));
                }
            }
        }
        json!({"type": "active_compactions_update", "compactions": compactions})
    }

    /// `storage_data` frame: latest snapshot and forecast per node
    pub async fn storage_data_payload(&self, view: &[String]) -> Value {
        let node_names = self.resolve_view(view);
        let db_path = self.db.db_path.clone();
        let query_nodes = node_names.clone();
        let latest = tokio::task::spawn_blocking(move || {
            db::get_latest_storage(&db_path, &query_nodes)
        })
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();

        let mut data = Vec::new();
        for snapshot in latest {
            let node_name = snapshot["node_name"].as_str().unwrap_or("").to_string();
            let available = snapshot["available_bytes"].as_i64().unwrap_or(0);
            let forecast =
                storage::calculate_storage_forecast(&self.db.db_path, &node_name, available).await;
            data.push(json!({"snapshot": snapshot, "forecast": forecast}));
        }
        json!({"type": "storage_data", "data": data})
    }

    /// `earnings_data` frame for a view and requested period selector
    pub async fn earnings_data_payload(&self, view: &[String], period_selector: &str) -> Value {
        let node_names = self.resolve_view(view);
        let current = earnings::period_of(&Utc::now());
        let (period, days) = match period_selector {
            "previous" => (earnings::previous_period(&current), 62),
            "12months" => (None, 365),
            _ => (Some(current.clone()), 31),
        };

        let db_path = self.db.db_path.clone();
        let query_period = period.clone();
        let rows = tokio::task::spawn_blocking(move || {
            db::get_earnings_estimates(&db_path, &node_names, query_period.as_deref(), days)
        })
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();

        let include_forecast = period_selector == "current";
        let data = earnings::earnings_rows_payload(
            &self.trackers,
            &self.db.db_path,
            rows,
            &current,
            include_forecast,
        )
        .await;
        json!({"type": "earnings_data", "period": period_selector, "data": data})
    }
}

async fn metrics_handler() -> String {
    metrics::gather_text()
}

async fn healthz_handler() -> &'static str {
    "ok"
}

fn build_router(ctx: Arc<AppContext>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .layer(cors)
        .layer(Extension(ctx))
}

/// Stats tick: recompute and fan out per-view payloads, but only when at
/// least one node saw new events.
fn spawn_stats_tick(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(config::stats_interval_seconds().max(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if ctx.hub.client_count().await == 0 {
                continue;
            }
            let mut any_dirty = false;
            for state in ctx.nodes.values() {
                if state.take_dirty().await {
                    any_dirty = true;
                }
            }
            if !any_dirty {
                continue;
            }

            for view in ctx.hub.active_views().await {
                let payload = ctx.stats.compute_payload(&view, &ctx).await;
                ctx.hub.broadcast_to_view(&payload, &view_key(&view)).await;
            }
        }
    });
}

/// Performance tick: short-window throughput/concurrency bins
fn spawn_performance_tick(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let interval_sec = config::performance_interval_seconds().max(1);
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_sec));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if ctx.hub.client_count().await == 0 {
                // Nothing to do, but drain so bins stay fresh
                for state in ctx.nodes.values() {
                    state.drain_perf_pending().await;
                }
                continue;
            }

            let mut per_node = HashMap::new();
            for (name, state) in &ctx.nodes {
                per_node.insert(name.clone(), state.drain_perf_pending().await);
            }

            for view in ctx.hub.active_views().await {
                let mut events = Vec::new();
                for name in ctx.resolve_view(&view) {
                    if let Some(node_events) = per_node.get(&name) {
                        events.extend(node_events.iter().cloned());
                    }
                }
                let bin = performance::live_performance_bin(&events, interval_sec as i64);
                let payload = json!({
                    "type": "performance_update",
                    "view": view,
                    "bin": bin,
                });
                ctx.hub.broadcast_to_view(&payload, &view_key(&view)).await;
            }
        }
    });
}

fn spawn_hourly_aggregator(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(config::hourly_agg_interval_minutes().max(1) * 60);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            ctx.db
                .send(DbCommand::HourlyAggregate(ctx.node_names.clone()))
                .await;
        }
    });
}

fn spawn_pruner(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(config::db_prune_interval_hours().max(1) * 3600);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            ctx.db
                .send(DbCommand::Prune(db::RetentionPolicy::from_config()))
                .await;
        }
    });
}

/// Refresh statistical baselines from the last 7 days of hourly stats.
async fn update_baselines(ctx: &AppContext) {
    for node_name in &ctx.node_names {
        let db_path = ctx.db.db_path.clone();
        let query_node = vec![node_name.clone()];
        let rows = tokio::task::spawn_blocking(move || {
            db::get_historical_stats(&db_path, &query_node, 168)
        })
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();
        if rows.len() < 2 {
            continue;
        }

        let mut success_rates = Vec::new();
        let mut egress_mbps = Vec::new();
        let mut ingress_mbps = Vec::new();
        for row in &rows {
            let successes = row["dl_success"].as_i64().unwrap_or(0)
                + row["ul_success"].as_i64().unwrap_or(0)
                + row["audit_success"].as_i64().unwrap_or(0);
            let failures = row["dl_fail"].as_i64().unwrap_or(0)
                + row["ul_fail"].as_i64().unwrap_or(0)
                + row["audit_fail"].as_i64().unwrap_or(0);
            let total = successes + failures;
            if total > 0 {
                success_rates.push(successes as f64 / total as f64);
            }
            egress_mbps.push(row["dl_mbps"].as_f64().unwrap_or(0.0));
            ingress_mbps.push(row["ul_mbps"].as_f64().unwrap_or(0.0));
        }

        for (metric, values) in [
            ("success_rate", success_rates),
            ("egress_mbps", egress_mbps),
            ("ingress_mbps", ingress_mbps),
        ] {
            ctx.analytics
                .calculate_baseline(node_name, metric, &values, 168)
                .await;
        }
    }
}

/// Alert evaluation cycle: thresholds over the latest reputation/storage/
/// latency data plus anomaly detection over the live window.
fn spawn_alert_evaluator(ctx: Arc<AppContext>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(config::alert_evaluation_interval_secs().max(60));
        let mut last_baseline_update: Option<tokio::time::Instant> = None;
        tracing::info!("alert evaluation task started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            tracing::info!("starting alert evaluation cycle");

            let refresh_baselines = last_baseline_update
                .map(|at| at.elapsed() >= BASELINE_UPDATE_INTERVAL)
                .unwrap_or(true);
            if refresh_baselines {
                update_baselines(&ctx).await;
                last_baseline_update = Some(tokio::time::Instant::now());
            }

            for node_name in &ctx.node_names {
                // Reputation thresholds + insights
                let db_path = ctx.db.db_path.clone();
                let query_node = vec![node_name.clone()];
                let reputation = tokio::task::spawn_blocking(move || {
                    db::get_latest_reputation(&db_path, &query_node)
                })
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or_default();

                if !reputation.is_empty() {
                    ctx.alerts
                        .evaluate_reputation_alerts(node_name, &reputation)
                        .await;
                    for insight in ctx
                        .analytics
                        .analyze_reputation_health(node_name, &reputation)
                    {
                        ctx.db.send(DbCommand::Insight(insight)).await;
                    }
                }

                // Storage thresholds, forecast, insights
                let db_path = ctx.db.db_path.clone();
                let query_node = vec![node_name.clone()];
                let latest_storage = tokio::task::spawn_blocking(move || {
                    db::get_latest_storage(&db_path, &query_node)
                })
                .await
                .ok()
                .and_then(|r| r.ok())
                .unwrap_or_default();

                if let Some(snapshot) = latest_storage.first() {
                    let available = snapshot["available_bytes"].as_i64().unwrap_or(0);
                    let forecast = storage::calculate_storage_forecast(
                        &ctx.db.db_path,
                        node_name,
                        available,
                    )
                    .await;
                    let days_until_full =
                        forecast.as_ref().and_then(|f| f["days_until_full"].as_f64());
                    ctx.alerts
                        .evaluate_storage_alerts(node_name, snapshot, days_until_full)
                        .await;

                    let db_path = ctx.db.db_path.clone();
                    let history_node = node_name.clone();
                    let history = tokio::task::spawn_blocking(move || {
                        db::get_storage_history(&db_path, &history_node, 7)
                    })
                    .await
                    .ok()
                    .and_then(|r| r.ok())
                    .unwrap_or_default();
                    for insight in ctx.analytics.analyze_storage_health(node_name, &history) {
                        ctx.db.send(DbCommand::Insight(insight)).await;
                    }
                }

                // Latency thresholds
                let db_path = ctx.db.db_path.clone();
                let query_node = vec![node_name.clone()];
                let latency = tokio::task::spawn_blocking(move || {
                    performance::latency_stats(&db_path, &query_node, 1)
                })
                .await
                .ok()
                .and_then(|r| r.ok());
                if let Some(latency) = latency {
                    let p99 = latency["statistics"]["all"]["p99"].as_f64().filter(|v| *v > 0.0);
                    ctx.alerts.evaluate_latency_alerts(node_name, p99).await;
                }

                // Anomaly detection over the live window
                if config::enable_anomaly_detection() {
                    if let Some(state) = ctx.nodes.get(node_name) {
                        let recent = state.snapshot().await;
                        if !recent.is_empty() {
                            let findings = ctx
                                .anomaly
                                .detect_traffic_anomalies(node_name, &recent)
                                .await;
                            for insight in &findings {
                                ctx.db.send(DbCommand::Insight(insight.clone())).await;
                            }
                            ctx.alerts.process_anomalies(&findings).await;
                        }
                    }
                }
            }
            tracing::info!("alert evaluation cycle complete");
        }
        tracing::info!("alert evaluation task cancelled");
    });
}

/// Build the context, start every worker, and serve until SIGINT/SIGTERM.
pub async fn run_server(nodes_config: Vec<NodeConfig>) -> Result<(), BoxError> {
    let db_path = config::database_file();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    metrics::register_metrics();

    let gate = Arc::new(ClientGate::new());
    let hub = Arc::new(WsHub::new(Arc::clone(&gate)));
    let geoip = GeoIpService::start(Arc::new(NullResolver), config::geoip_cache_size());
    let db_handle = db_writer::start(db_path.clone(), shutdown_rx.clone());

    // Re-hydrate each node's live window from the database
    let window_minutes = config::stats_window_minutes();
    let mut nodes: NodeRegistry = HashMap::new();
    for node in &nodes_config {
        let state = Arc::new(NodeState::new(node.name.clone(), window_minutes));
        let path = db_path.clone();
        let name = node.name.clone();
        let initial = tokio::task::spawn_blocking(move || {
            db::load_initial_events(&path, &name, window_minutes)
        })
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();
        if !initial.is_empty() {
            tracing::info!(node = node.name.as_str(), events = initial.len(), "re-hydrated live window");
        }
        state.rehydrate(initial).await;
        nodes.insert(node.name.clone(), state);
    }
    let node_names: Vec<String> = nodes_config.iter().map(|n| n.name.clone()).collect();

    let api_clients = build_api_clients(&nodes_config).await;
    let notifications = Arc::new(NotificationHandler::new());
    let analytics = Arc::new(AnalyticsEngine::new(db_handle.clone()));
    let anomaly = Arc::new(AnomalyDetector::new(Arc::clone(&analytics)));
    let alerts = Arc::new(AlertManager::new(
        db_handle.clone(),
        Arc::clone(&hub),
        Arc::clone(&notifications),
    ));

    let mut trackers = HashMap::new();
    for node in &nodes_config {
        trackers.insert(
            node.name.clone(),
            Arc::new(FinancialTracker::new(
                &node.name,
                api_clients.get(&node.name).cloned(),
            )),
        );
    }

    let ctx = Arc::new(AppContext {
        nodes,
        node_names,
        hub: Arc::clone(&hub),
        db: db_handle.clone(),
        stats: Arc::new(StatsCenter::new()),
        alerts: Arc::clone(&alerts),
        analytics,
        anomaly,
        trackers: trackers.clone(),
        api_clients: api_clients.clone(),
    });

    // Ingestion: one worker per node
    for node in nodes_config {
        let state = Arc::clone(ctx.nodes.get(&node.name).expect("node state exists"));
        ingest::spawn_node_ingest(
            node,
            state,
            db_handle.clone(),
            Arc::clone(&hub),
            Arc::clone(&geoip),
            Arc::clone(&gate),
            shutdown_rx.clone(),
        );
    }

    // Broadcast and polling machinery
    websocket::spawn_log_batcher(Arc::clone(&hub), shutdown_rx.clone());
    spawn_stats_tick(Arc::clone(&ctx), shutdown_rx.clone());
    spawn_performance_tick(Arc::clone(&ctx), shutdown_rx.clone());
    spawn_hourly_aggregator(Arc::clone(&ctx), shutdown_rx.clone());
    spawn_pruner(Arc::clone(&ctx), shutdown_rx.clone());
    spawn_alert_evaluator(Arc::clone(&ctx), shutdown_rx.clone());
    crate::reputation::spawn_reputation_poller(
        api_clients.clone(),
        db_handle.clone(),
        Arc::clone(&hub),
        Arc::clone(&alerts),
        shutdown_rx.clone(),
    );
    storage::spawn_storage_poller(
        api_clients,
        db_handle.clone(),
        Arc::clone(&hub),
        Arc::clone(&alerts),
        shutdown_rx.clone(),
    );
    earnings::spawn_earnings_poller(
        trackers,
        db_handle.clone(),
        Arc::clone(&hub),
        shutdown_rx.clone(),
    );

    // HTTP/WS server with graceful shutdown
    let addr = format!("{}:{}", config::server_host(), config::server_port());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| format!("cannot bind {}: {}", addr, e))?;
    tracing::info!("listening on {}", addr);

    let mut serve_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, build_router(Arc::clone(&ctx)))
        .with_graceful_shutdown(async move {
            let _ = serve_shutdown.changed().await;
        });

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            tracing::error!("server error: {}", e);
        }
    });

    // Wait for SIGINT/SIGTERM, then run the shutdown sequence within budget
    wait_for_signal().await;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    let shutdown_sequence = async {
        // Let workers drain, then force the final batch commit
        tokio::time::sleep(Duration::from_millis(500)).await;
        db_handle.flush().await;
        let _ = server_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_BUDGET, shutdown_sequence)
        .await
        .is_err()
    {
        tracing::warn!("shutdown budget exceeded, exiting anyway");
    }
    tracing::info!("shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NodeSource;
    use tempfile::TempDir;

    async fn test_ctx() -> (Arc<AppContext>, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("srv.db").to_str().unwrap().to_string();
        db::init_db(&path).unwrap();

        let (tx, rx) = watch::channel(false);
        // The writer must outlive this fixture function
        std::mem::forget(tx);
        let db_handle = db_writer::start(path, rx);
        let gate = Arc::new(ClientGate::new());
        let hub = Arc::new(WsHub::new(gate));
        let notifications = Arc::new(NotificationHandler::new());
        let analytics = Arc::new(AnalyticsEngine::new(db_handle.clone()));
        let anomaly = Arc::new(AnomalyDetector::new(Arc::clone(&analytics)));
        let alerts = Arc::new(AlertManager::new(
            db_handle.clone(),
            Arc::clone(&hub),
            notifications,
        ));

        let mut nodes: NodeRegistry = HashMap::new();
        nodes.insert("alpha".to_string(), Arc::new(NodeState::new("alpha", 60)));
        nodes.insert("beta".to_string(), Arc::new(NodeState::new("beta", 60)));

        let ctx = Arc::new(AppContext {
            nodes,
            node_names: vec!["alpha".to_string(), "beta".to_string()],
            hub,
            db: db_handle,
            stats: Arc::new(StatsCenter::new()),
            alerts,
            analytics,
            anomaly,
            trackers: HashMap::new(),
            api_clients: HashMap::new(),
        });
        (ctx, dir)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resolve_view() {
        let (ctx, _dir) = test_ctx().await;
        let all = ctx.resolve_view(&["Aggregate".to_string()]);
        assert_eq!(all.len(), 2);

        let one = ctx.resolve_view(&["alpha".to_string()]);
        assert_eq!(one, vec!["alpha".to_string()]);

        // Unknown node names are dropped
        let none = ctx.resolve_view(&["gamma".to_string()]);
        assert!(none.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stats_payload_cached_after_compute() {
        let (ctx, _dir) = test_ctx().await;
        let view = vec!["Aggregate".to_string()];
        assert!(ctx.stats.cached_payload(&view).await.is_none());

        let payload = ctx.stats.compute_payload(&view, &ctx).await;
        assert_eq!(payload["type"], "stats_update");

        let cached = ctx.stats.cached_payload(&view).await.unwrap();
        assert_eq!(cached["type"], "stats_update");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_node_descriptor_round_trip_through_context() {
        let (ctx, _dir) = test_ctx().await;
        let node = NodeConfig {
            name: "alpha".to_string(),
            source: NodeSource::File {
                path: "/tmp/x.log".to_string(),
            },
            api_url: None,
        };
        assert!(ctx.nodes.contains_key(&node.name));
    }
}
