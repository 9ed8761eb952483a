/// WebSocket Hub - Real-time dashboard streaming
///
/// Holds the view-subscribed client registry, performs resilient
/// concurrent fan-out with eviction of dead clients, batches
/// high-frequency log-entry events, and dispatches client request frames.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
    Extension,
};
use futures::{stream::StreamExt, SinkExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use crate::config;
use crate::db;
use crate::log_source::ClientGate;
use crate::metrics;
use crate::performance;
use crate::reputation;
use crate::server::AppContext;
use crate::stats::view_key;

/// Per-client outbound queue depth. A client that cannot drain this many
/// frames is considered dead.
const CLIENT_QUEUE_CAP: usize = 256;
/// Write timeout per client before it is disconnected
const CLIENT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

struct ClientEntry {
    view: Vec<String>,
    tx: mpsc::Sender<String>,
}

struct PendingLogEntry {
    arrival: Instant,
    node_name: String,
    event: Value,
}

/// Client registry plus broadcast and batching machinery
pub struct WsHub {
    clients: Mutex<HashMap<u64, ClientEntry>>,
    next_id: AtomicU64,
    pending_logs: Mutex<Vec<PendingLogEntry>>,
    gate: Arc<ClientGate>,
}

impl WsHub {
    pub fn new(gate: Arc<ClientGate>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            pending_logs: Mutex::new(Vec::new()),
            gate,
        }
    }

    /// Register a connection; returns its id and the frame receiver the
    /// session's writer task drains.
    pub async fn register(&self) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAP);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut clients = self.clients.lock().await;
        let was_empty = clients.is_empty();
        clients.insert(
            id,
            ClientEntry {
                view: vec!["Aggregate".to_string()],
                tx,
            },
        );
        metrics::WS_CLIENTS.set(clients.len() as i64);
        if was_empty {
            tracing::info!("first client connected, waking log sources");
            self.gate.set_active(true);
        }
        (id, rx)
    }

    pub async fn unregister(&self, id: u64) {
        let mut clients = self.clients.lock().await;
        clients.remove(&id);
        metrics::WS_CLIENTS.set(clients.len() as i64);
        if clients.is_empty() {
            tracing::info!("last client disconnected, pausing log sources");
            self.gate.set_active(false);
        }
    }

    pub async fn set_view(&self, id: u64, view: Vec<String>) {
        let mut clients = self.clients.lock().await;
        if let Some(entry) = clients.get_mut(&id) {
            entry.view = view;
        }
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Distinct views across connected clients
    pub async fn active_views(&self) -> Vec<Vec<String>> {
        let clients = self.clients.lock().await;
        let mut seen: HashMap<String, Vec<String>> = HashMap::new();
        for entry in clients.values() {
            seen.entry(view_key(&entry.view))
                .or_insert_with(|| entry.view.clone());
        }
        seen.into_values().collect()
    }

    fn view_matches(view: &[String], node_name: &str) -> bool {
        view.iter().any(|v| v == "Aggregate") || view.iter().any(|v| v == node_name)
    }

    /// Send a payload to all clients, or to those whose view covers
    /// `node_name`. Sends are queued per client; dead clients are evicted.
    pub async fn broadcast(&self, payload: &Value, node_name: Option<&str>) {
        let frame = payload.to_string();
        let mut dead = Vec::new();
        {
            let clients = self.clients.lock().await;
            for (id, entry) in clients.iter() {
                if let Some(node) = node_name {
                    if !Self::view_matches(&entry.view, node) {
                        continue;
                    }
                }
                match entry.tx.try_send(frame.clone()) {
                    Ok(()) => metrics::WS_SENDS.with_label_values(&["ok"]).inc(),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        metrics::WS_SENDS.with_label_values(&["backpressure"]).inc();
                        dead.push(*id);
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        metrics::WS_SENDS.with_label_values(&["closed"]).inc();
                        dead.push(*id);
                    }
                }
            }
        }
        for id in dead {
            tracing::debug!(client = id, "evicting unresponsive client");
            self.unregister(id).await;
        }
    }

    /// Send a payload to every client subscribed to exactly this view
    pub async fn broadcast_to_view(&self, payload: &Value, key: &str) {
        let frame = payload.to_string();
        let mut dead = Vec::new();
        {
            let clients = self.clients.lock().await;
            for (id, entry) in clients.iter() {
                if view_key(&entry.view) != key {
                    continue;
                }
                match entry.tx.try_send(frame.clone()) {
                    Ok(()) => metrics::WS_SENDS.with_label_values(&["ok"]).inc(),
                    Err(_) => {
                        metrics::WS_SENDS.with_label_values(&["backpressure"]).inc();
                        dead.push(*id);
                    }
                }
            }
        }
        for id in dead {
            self.unregister(id).await;
        }
    }

    /// Queue one frame for a single client
    pub async fn send_to(&self, id: u64, payload: &Value) {
        let clients = self.clients.lock().await;
        if let Some(entry) = clients.get(&id) {
            if entry.tx.try_send(payload.to_string()).is_err() {
                metrics::WS_SENDS.with_label_values(&["backpressure"]).inc();
            }
        }
    }

    /// Queue a parsed log line for the batch flusher.
    pub async fn queue_log_entry(&self, node_name: &str, event: Value) {
        let mut pending = self.pending_logs.lock().await;
        pending.push(PendingLogEntry {
            arrival: Instant::now(),
            node_name: node_name.to_string(),
            event,
        });
    }

    async fn flush_log_batches(&self) {
        let drained: Vec<PendingLogEntry> = {
            let mut pending = self.pending_logs.lock().await;
            if pending.is_empty() {
                return;
            }
            std::mem::take(&mut *pending)
        };

        let batch_size = config::websocket_batch_size().max(1);
        let mut by_node: HashMap<String, Vec<PendingLogEntry>> = HashMap::new();
        for entry in drained {
            by_node.entry(entry.node_name.clone()).or_default().push(entry);
        }

        for (node_name, entries) in by_node {
            for chunk in entries.chunks(batch_size) {
                let first_arrival = chunk[0].arrival;
                let events: Vec<Value> = chunk
                    .iter()
                    .map(|entry| {
                        let mut event = entry.event.clone();
                        if let Some(map) = event.as_object_mut() {
                            map.insert(
                                "arrival_offset_ms".to_string(),
                                json!(entry
                                    .arrival
                                    .duration_since(first_arrival)
                                    .as_millis() as u64),
                            );
                        }
                        event
                    })
                    .collect();
                let payload = json!({"type": "log_entry_batch", "events": events});
                self.broadcast(&payload, Some(&node_name)).await;
            }
        }
    }
}

/// Background flusher coalescing log-entry events every batch interval.
pub fn spawn_log_batcher(hub: Arc<WsHub>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let interval = Duration::from_millis(config::websocket_batch_interval_ms().max(1));
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => hub.flush_log_batches().await,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

/// Axum handler for the dashboard WebSocket endpoint
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(ctx): Extension<Arc<AppContext>>,
) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, ctx))
}

async fn handle_socket(socket: WebSocket, ctx: Arc<AppContext>) {
    let (mut sender, mut receiver) = socket.split();
    let (client_id, mut rx) = ctx.hub.register().await;

    let init = json!({"type": "init", "nodes": ctx.node_names});
    if sender
        .send(Message::Text(init.to_string().into()))
        .await
        .is_err()
    {
        ctx.hub.unregister(client_id).await;
        return;
    }

    // Writer: drain the hub queue into the socket, dropping the client if a
    // single write stalls past the timeout.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let send = sender.send(Message::Text(frame.into()));
            match tokio::time::timeout(CLIENT_WRITE_TIMEOUT, send).await {
                Ok(Ok(())) => {}
                _ => break,
            }
        }
    });

    // Reader: handle request frames until the client goes away.
    let reader_ctx = Arc::clone(&ctx);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Ok(value) = serde_json::from_str::<Value>(&text) {
                        handle_client_frame(&reader_ctx, client_id, value).await;
                    }
                    // Malformed JSON is ignored, not a disconnect
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    ctx.hub.unregister(client_id).await;
}

fn parse_view(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect::<Vec<String>>()
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| vec!["Aggregate".to_string()])
}

async fn handle_client_frame(ctx: &Arc<AppContext>, client_id: u64, msg: Value) {
    let msg_type = match msg["type"].as_str() {
        Some(t) => t,
        None => return,
    };

    match msg_type {
        "set_view" => {
            let view = parse_view(&msg["view"]);
            ctx.hub.set_view(client_id, view.clone()).await;

            let payload = match ctx.stats.cached_payload(&view).await {
                Some(payload) => payload,
                None => ctx.stats.compute_payload(&view, ctx).await,
            };
            ctx.hub.send_to(client_id, &payload).await;

            let compactions = ctx.active_compactions_payload(&view).await;
            ctx.hub.send_to(client_id, &compactions).await;
        }
        "get_historical_performance" => {
            let view = parse_view(&msg["view"]);
            let points = msg["points"].as_i64().unwrap_or(180).clamp(1, 2000) as usize;
            let interval_sec = msg["interval_sec"].as_i64().unwrap_or(2).max(1);
            let events = ctx.events_for_view(&view).await;
            let data = performance::historical_performance(&events, points, interval_sec);
            let payload = json!({
                "type": "historical_performance_data",
                "view": view,
                "performance_data": data,
            });
            ctx.hub.send_to(client_id, &payload).await;
        }
        "get_aggregated_performance" => {
            let view = parse_view(&msg["view"]);
            let hours = msg["hours"].as_i64().unwrap_or(6).clamp(1, 24 * 30);
            let nodes = ctx.resolve_view(&view);
            let db_path = ctx.db.db_path.clone();
            let data = tokio::task::spawn_blocking(move || {
                performance::aggregated_performance(&db_path, &nodes, hours)
            })
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
            let payload = json!({
                "type": "aggregated_performance_data",
                "view": view,
                "performance_data": data,
            });
            ctx.hub.send_to(client_id, &payload).await;
        }
        "get_hashstore_stats" => {
            let filters = &msg["filters"];
            let node_filter: Option<Vec<String>> = match &filters["node_name"] {
                Value::String(s) if s != "all" => Some(vec![s.clone()]),
                Value::Array(arr) => Some(
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect(),
                ),
                _ => None,
            };
            let satellite = filters["satellite"]
                .as_str()
                .filter(|s| *s != "all")
                .map(|s| s.to_string());
            let store = filters["store"]
                .as_str()
                .filter(|s| *s != "all")
                .map(|s| s.to_string());
            let db_path = ctx.db.db_path.clone();
            let rows = tokio::task::spawn_blocking(move || {
                db::get_hashstore_stats(
                    &db_path,
                    node_filter.as_deref(),
                    satellite.as_deref(),
                    store.as_deref(),
                )
            })
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
            let payload = json!({"type": "hashstore_stats_data", "data": rows});
            ctx.hub.send_to(client_id, &payload).await;
        }
        "get_reputation_data" => {
            let view = parse_view(&msg["view"]);
            let nodes = ctx.resolve_view(&view);
            let db_path = ctx.db.db_path.clone();
            let mut rows = tokio::task::spawn_blocking(move || {
                db::get_latest_reputation(&db_path, &nodes)
            })
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
            for row in &mut rows {
                let health = reputation::calculate_reputation_health_score(row);
                if let Some(map) = row.as_object_mut() {
                    map.insert("health_score".to_string(), json!(health));
                }
            }
            let payload = json!({"type": "reputation_data", "data": rows});
            ctx.hub.send_to(client_id, &payload).await;
        }
        "get_latency_stats" => {
            let view = parse_view(&msg["view"]);
            let hours = msg["hours"].as_i64().unwrap_or(1).clamp(1, 24 * 7);
            let nodes = ctx.resolve_view(&view);
            let db_path = ctx.db.db_path.clone();
            let data = tokio::task::spawn_blocking(move || {
                performance::latency_stats(&db_path, &nodes, hours)
            })
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_else(|| json!({"statistics": {}, "slow_operations": []}));
            let payload = json!({"type": "latency_stats", "data": data});
            ctx.hub.send_to(client_id, &payload).await;
        }
        "get_latency_histogram" => {
            let view = parse_view(&msg["view"]);
            let hours = msg["hours"].as_i64().unwrap_or(1).clamp(1, 24 * 7);
            let bucket_size_ms = msg["bucket_size_ms"].as_i64().unwrap_or(100).max(1);
            let nodes = ctx.resolve_view(&view);
            let db_path = ctx.db.db_path.clone();
            let data = tokio::task::spawn_blocking(move || {
                performance::latency_histogram(&db_path, &nodes, hours, bucket_size_ms)
            })
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
            let payload = json!({"type": "latency_histogram", "data": data});
            ctx.hub.send_to(client_id, &payload).await;
        }
        "get_storage_data" => {
            let view = parse_view(&msg["view"]);
            let payload = ctx.storage_data_payload(&view).await;
            ctx.hub.send_to(client_id, &payload).await;
        }
        "get_storage_history" => {
            let node_name = msg["node_name"].as_str().unwrap_or("").to_string();
            let days = msg["days"].as_i64().unwrap_or(7).clamp(1, 365);
            let db_path = ctx.db.db_path.clone();
            let history_node = node_name.clone();
            let rows = tokio::task::spawn_blocking(move || {
                db::get_storage_history(&db_path, &history_node, days)
            })
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
            let payload = json!({
                "type": "storage_history",
                "node_name": node_name,
                "data": rows,
            });
            ctx.hub.send_to(client_id, &payload).await;
        }
        "get_active_alerts" => {
            let view = parse_view(&msg["view"]);
            let nodes = ctx.resolve_view(&view);
            let alerts = ctx.alerts.active_alerts(Some(&nodes)).await;
            let payload = json!({"type": "active_alerts", "alerts": alerts});
            ctx.hub.send_to(client_id, &payload).await;
        }
        "acknowledge_alert" => {
            if let Some(alert_id) = msg["alert_id"].as_i64() {
                ctx.alerts.acknowledge_alert(alert_id).await;
            }
        }
        "get_insights" => {
            let view = parse_view(&msg["view"]);
            let hours = msg["hours"].as_i64().unwrap_or(24).clamp(1, 24 * 30);
            let nodes = ctx.resolve_view(&view);
            let db_path = ctx.db.db_path.clone();
            let rows = tokio::task::spawn_blocking(move || {
                db::get_insights(&db_path, Some(&nodes), hours)
            })
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
            let payload = json!({"type": "insights_data", "insights": rows});
            ctx.hub.send_to(client_id, &payload).await;
        }
        "get_alert_summary" => {
            let summary = ctx.alerts.alert_summary().await;
            let payload = json!({"type": "alert_summary", "summary": summary});
            ctx.hub.send_to(client_id, &payload).await;
        }
        "get_earnings_data" => {
            let view = parse_view(&msg["view"]);
            let period = msg["period"].as_str().unwrap_or("current");
            let payload = ctx.earnings_data_payload(&view, period).await;
            ctx.hub.send_to(client_id, &payload).await;
        }
        "get_earnings_history" => {
            let node_name = msg["node_name"].as_str().unwrap_or("").to_string();
            let satellite = msg["satellite"].as_str().map(|s| s.to_string());
            let days = msg["days"].as_i64().unwrap_or(365).clamp(1, 730);
            let db_path = ctx.db.db_path.clone();
            let history_node = node_name.clone();
            let rows = tokio::task::spawn_blocking(move || {
                db::get_earnings_history(&db_path, &history_node, satellite.as_deref(), days)
            })
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
            let payload = json!({
                "type": "earnings_history",
                "node_name": node_name,
                "history": rows,
            });
            ctx.hub.send_to(client_id, &payload).await;
        }
        "get_comparison_data" => {
            let node_names: Vec<String> = msg["node_names"]
                .as_array()
                .map(|arr| {
                    arr.iter()
                        .filter_map(|v| v.as_str().map(|s| s.to_string()))
                        .collect()
                })
                .unwrap_or_default();
            let comparison_type = msg["comparison_type"].as_str().unwrap_or("performance");
            let time_range = msg["time_range"].as_i64().unwrap_or(24).clamp(1, 24 * 30);
            let payload = crate::comparison::comparison_payload(
                ctx,
                &node_names,
                comparison_type,
                time_range,
            )
            .await;
            ctx.hub.send_to(client_id, &payload).await;
        }
        _ => {
            // Unknown frame types are ignored per protocol
            tracing::debug!(frame = msg_type, "ignoring unknown client frame");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_view_matching() {
        let aggregate = vec!["Aggregate".to_string()];
        let named = vec!["alpha".to_string(), "beta".to_string()];
        assert!(WsHub::view_matches(&aggregate, "anything"));
        assert!(WsHub::view_matches(&named, "alpha"));
        assert!(!WsHub::view_matches(&named, "gamma"));
    }

    #[test]
    fn test_parse_view_defaults_to_aggregate() {
        assert_eq!(parse_view(&json!(null)), vec!["Aggregate".to_string()]);
        assert_eq!(parse_view(&json!([])), vec!["Aggregate".to_string()]);
        assert_eq!(
            parse_view(&json!(["alpha"])),
            vec!["alpha".to_string()]
        );
    }

    #[tokio::test]
    async fn test_broadcast_filters_by_view() {
        let gate = Arc::new(ClientGate::new());
        let hub = WsHub::new(gate);

        let (agg_id, mut agg_rx) = hub.register().await;
        let (named_id, mut named_rx) = hub.register().await;
        hub.set_view(named_id, vec!["alpha".to_string()]).await;

        hub.broadcast(&json!({"type": "t", "n": 1}), Some("beta")).await;
        hub.broadcast(&json!({"type": "t", "n": 2}), Some("alpha")).await;
        hub.broadcast(&json!({"type": "t", "n": 3}), None).await;

        // Aggregate client sees every broadcast
        for expected in [1, 2, 3] {
            let frame = agg_rx.try_recv().expect("aggregate client should receive");
            let v: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(v["n"], expected);
        }
        // Named client sees only its node and the global broadcast
        let frame = named_rx.try_recv().unwrap();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["n"], 2);
        let frame = named_rx.try_recv().unwrap();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["n"], 3);
        assert!(named_rx.try_recv().is_err());

        hub.unregister(agg_id).await;
        hub.unregister(named_id).await;
        assert_eq!(hub.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_dead_clients_evicted_on_broadcast() {
        let gate = Arc::new(ClientGate::new());
        let hub = WsHub::new(gate);
        let (_id, rx) = hub.register().await;
        drop(rx);
        hub.broadcast(&json!({"type": "t"}), None).await;
        assert_eq!(hub.client_count().await, 0);
    }

    #[tokio::test]
    async fn test_log_batch_carries_arrival_offsets() {
        let gate = Arc::new(ClientGate::new());
        let hub = WsHub::new(gate);
        let (_id, mut rx) = hub.register().await;

        hub.queue_log_entry("alpha", json!({"action": "GET"})).await;
        hub.queue_log_entry("alpha", json!({"action": "PUT"})).await;
        hub.flush_log_batches().await;

        let frame = rx.try_recv().unwrap();
        let v: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(v["type"], "log_entry_batch");
        let events = v["events"].as_array().unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0]["arrival_offset_ms"], 0);
        assert!(events[1]["arrival_offset_ms"].as_u64().is_some());
    }

    #[tokio::test]
    async fn test_gate_follows_client_presence() {
        let gate = Arc::new(ClientGate::new());
        let hub = WsHub::new(Arc::clone(&gate));
        assert!(!gate.is_active());
        let (id, _rx) = hub.register().await;
        assert!(gate.is_active());
        hub.unregister(id).await;
        assert!(!gate.is_active());
    }
}
