/// Ingestion Workers
///
/// One worker per node wires its log source through the parser into the
/// in-memory ring and the DB queue, pairing compaction begin/end along the
/// way. A separate bulk path ingests whole log files for the one-shot
/// `--ingest-log` mode.

use serde_json::json;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::config;
use crate::db;
use crate::db_utils::with_retry;
use crate::db_writer::{DbCommand, DbHandle};
use crate::geoip::GeoIpService;
use crate::log_source::{spawn_file_tailer, spawn_network_source, ClientGate};
use crate::metrics;
use crate::node_state::NodeState;
use crate::parser::parse_log_line;
use crate::types::{
    iso_micros, BoxError, CompactionKey, CompactionRecord, NodeConfig, NodeSource, ParsedLine,
    TrafficEvent,
};
use crate::websocket::WsHub;

/// Line channel depth between a source and its ingest worker
const LINE_CHANNEL_CAP: usize = 10_000;

fn log_entry_json(event: &TrafficEvent) -> serde_json::Value {
    json!({
        "timestamp": iso_micros(&event.timestamp),
        "node_name": event.node_name,
        "action": event.action,
        "status": event.status.as_str(),
        "size": event.size,
        "satellite": config::satellite_display_name(&event.satellite_id),
        "category": event.category.as_str(),
        "error_reason": event.error_reason,
        "duration_ms": event.duration_ms,
        "country": event.location.country,
    })
}

async fn compactions_frame(state: &NodeState) -> serde_json::Value {
    let compactions: Vec<serde_json::Value> = state
        .active_compactions()
        .await
        .into_iter()
        .map(|(key, started)| {
            json!({
                "node_name": key.node_name,
                "satellite": key.satellite,
                "store": key.store,
                "start_iso": iso_micros(&started),
            })
        })
        .collect();
    json!({"type": "active_compactions_update", "compactions": compactions})
}

/// Minimum spacing between persisted log-derived storage snapshots
const STORAGE_HINT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(300);

async fn handle_parsed_line(
    parsed: ParsedLine,
    node_name: &str,
    state: &Arc<NodeState>,
    db: &DbHandle,
    hub: &Arc<WsHub>,
    last_storage_hint: &mut Option<tokio::time::Instant>,
) {
    match parsed {
        ParsedLine::Traffic(event) => {
            metrics::EVENTS_INGESTED.with_label_values(&[node_name]).inc();
            hub.queue_log_entry(node_name, log_entry_json(&event)).await;
            state.append_event(Arc::new(event.clone())).await;
            db.submit_event(event);
        }
        ParsedLine::CompactionBegin { key, timestamp } => {
            state.begin_compaction(key, timestamp).await;
            let frame = compactions_frame(state).await;
            hub.broadcast(&frame, Some(node_name)).await;
        }
        ParsedLine::CompactionEnd {
            key,
            timestamp,
            mut record,
        } => {
            // Recompute the duration when we observed the begin; otherwise
            // the end line's declared duration stands.
            if let Some(started) = state.end_compaction(&key).await {
                if record.duration == 0.0 {
                    let elapsed = (timestamp - started).num_milliseconds() as f64 / 1000.0;
                    record.duration = (elapsed * 100.0).round() / 100.0;
                }
            }
            db.send(DbCommand::Compaction(record)).await;
            let frame = compactions_frame(state).await;
            hub.broadcast(&frame, Some(node_name)).await;
        }
        ParsedLine::StorageHint {
            available_bytes, ..
        } => {
            // Log-derived hints arrive with nearly every operation; persist
            // at most one partial snapshot per interval.
            let due = last_storage_hint
                .map(|at| at.elapsed() >= STORAGE_HINT_INTERVAL)
                .unwrap_or(true);
            if due {
                *last_storage_hint = Some(tokio::time::Instant::now());
                let snapshot = crate::storage::partial_snapshot(node_name, available_bytes);
                db.send(DbCommand::StorageSnapshot(snapshot)).await;
            }
        }
    }
}

/// Start the source and worker for one node. Parsed events reach the ring
/// and the DB queue in strict arrival order.
pub fn spawn_node_ingest(
    node: NodeConfig,
    state: Arc<NodeState>,
    db: DbHandle,
    hub: Arc<WsHub>,
    geoip: Arc<GeoIpService>,
    gate: Arc<ClientGate>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_CHANNEL_CAP);

    match &node.source {
        NodeSource::File { path } => {
            spawn_file_tailer(
                node.name.clone(),
                path.clone(),
                gate,
                line_tx,
                shutdown.clone(),
            );
        }
        NodeSource::Network { host, port } => {
            spawn_network_source(node.name.clone(), host.clone(), *port, line_tx, shutdown.clone());
        }
    }

    tokio::spawn(async move {
        let node_name = node.name.clone();
        let mut last_storage_hint: Option<tokio::time::Instant> = None;
        tracing::info!(node = node_name.as_str(), "ingest worker started");
        loop {
            tokio::select! {
                maybe_line = line_rx.recv() => {
                    match maybe_line {
                        Some(line) => {
                            match parse_log_line(&line, &node_name, Some(&geoip)) {
                                Some(parsed) => {
                                    handle_parsed_line(
                                        parsed,
                                        &node_name,
                                        &state,
                                        &db,
                                        &hub,
                                        &mut last_storage_hint,
                                    )
                                    .await;
                                }
                                None => {
                                    if !line.trim().is_empty() {
                                        metrics::PARSE_ERRORS
                                            .with_label_values(&[node_name.as_str()])
                                            .inc();
                                    }
                                }
                            }
                        }
                        None => break,
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Drain whatever the source already delivered into the DB queue
        while let Ok(line) = line_rx.try_recv() {
            if let Some(ParsedLine::Traffic(event)) =
                parse_log_line(&line, &node_name, Some(&geoip))
            {
                db.submit_event(event);
            }
        }
        tracing::info!(node = node_name.as_str(), "ingest worker stopped");
    });
}

/// One-shot bulk ingestion of a complete log file: parse everything, batch
/// the traffic events, pair compactions in memory, then backfill hourly
/// stats. Blocking; run it on a blocking thread.
pub fn run_bulk_ingest(node_name: &str, log_path: &str, db_path: &str) -> Result<(), BoxError> {
    tracing::info!(node = node_name, path = log_path, "starting log ingestion");
    let file = File::open(log_path)
        .map_err(|e| format!("cannot open log file '{}': {}", log_path, e))?;
    let reader = BufReader::new(file);

    let batch_size = config::db_ingest_batch_size();
    let mut events: Vec<TrafficEvent> = Vec::with_capacity(batch_size);
    let mut compaction_records: Vec<CompactionRecord> = Vec::new();
    let mut active_compactions: HashMap<CompactionKey, chrono::DateTime<chrono::Utc>> =
        HashMap::new();

    let mut line_count: u64 = 0;
    let mut traffic_count: u64 = 0;

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("read error during ingestion: {}", e);
                continue;
            }
        };
        line_count += 1;
        if line_count % 100_000 == 0 {
            tracing::info!("processed {} lines...", line_count);
        }

        match parse_log_line(&line, node_name, None) {
            Some(ParsedLine::Traffic(event)) => {
                events.push(event);
                if events.len() >= batch_size {
                    tracing::info!("writing a batch of {} traffic events...", events.len());
                    with_retry(|| db::write_event_batch(db_path, &events))?;
                    traffic_count += events.len() as u64;
                    events.clear();
                }
            }
            Some(ParsedLine::CompactionBegin { key, timestamp }) => {
                active_compactions.insert(key, timestamp);
            }
            Some(ParsedLine::CompactionEnd {
                key,
                timestamp,
                mut record,
            }) => {
                if let Some(started) = active_compactions.remove(&key) {
                    if record.duration == 0.0 {
                        let elapsed = (timestamp - started).num_milliseconds() as f64 / 1000.0;
                        record.duration = (elapsed * 100.0).round() / 100.0;
                    }
                }
                compaction_records.push(record);
            }
            // Storage hints are only meaningful live; historical replays skip them
            Some(ParsedLine::StorageHint { .. }) | None => {}
        }
    }

    if !events.is_empty() {
        tracing::info!("writing the final batch of {} traffic events...", events.len());
        with_retry(|| db::write_event_batch(db_path, &events))?;
        traffic_count += events.len() as u64;
    }
    if !compaction_records.is_empty() {
        tracing::info!("writing {} compaction records...", compaction_records.len());
        with_retry(|| db::write_compaction_batch(db_path, &compaction_records))?;
    }

    tracing::info!(
        lines = line_count,
        traffic_events = traffic_count,
        compactions = compaction_records.len(),
        "ingestion complete, backfilling hourly statistics"
    );
    with_retry(|| db::backfill_hourly_stats(db_path))?;
    tracing::info!("hourly statistics backfilled, process complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const TRAFFIC_LINE: &str = "2025-01-08T10:00:00.123Z\tINFO\tpiecestore\tdownloaded\t{\"Piece ID\":\"P\",\"Satellite ID\":\"S\",\"Action\":\"GET\",\"Size\":2048,\"Remote Address\":\"192.168.1.1:1234\"}";
    const BEGIN_LINE: &str = "2025-01-08T10:00:01.000Z\tINFO\thashstore\tbeginning compaction\t{\"Satellite ID\":\"S1\",\"Store\":\"s0\"}";
    const END_LINE: &str = "2025-01-08T10:03:01.000Z\tINFO\thashstore\tfinished compaction\t{\"Satellite ID\":\"S1\",\"Store\":\"s0\",\"Data Reclaimed\":4096}";

    #[test]
    fn test_bulk_ingest_end_to_end() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("ingest.db").to_str().unwrap().to_string();
        db::init_db(&db_path).unwrap();

        let log_path = dir.path().join("node.log");
        let mut file = File::create(&log_path).unwrap();
        for _ in 0..3 {
            writeln!(file, "{}", TRAFFIC_LINE).unwrap();
        }
        writeln!(file, "{}", BEGIN_LINE).unwrap();
        writeln!(file, "not a parseable line").unwrap();
        writeln!(file, "{}", END_LINE).unwrap();
        file.sync_all().unwrap();

        run_bulk_ingest("node-a", log_path.to_str().unwrap(), &db_path).unwrap();

        let conn = crate::db_utils::open_connection(&db_path, true).unwrap();
        let events: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(events, 3);

        // Compaction pair produced one record with the recomputed duration
        let (count, duration): (i64, f64) = conn
            .query_row(
                "SELECT COUNT(*), MAX(duration) FROM hashstore_compaction_history",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(count, 1);
        assert!((duration - 180.0).abs() < 0.01);

        // Hourly stats were backfilled
        let hourly: i64 = conn
            .query_row("SELECT COUNT(*) FROM hourly_stats", [], |row| row.get(0))
            .unwrap();
        assert_eq!(hourly, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handle_parsed_line_updates_state_and_queue() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("live.db").to_str().unwrap().to_string();
        db::init_db(&db_path).unwrap();

        let (_tx, rx) = watch::channel(false);
        let db = crate::db_writer::start(db_path.clone(), rx);
        let hub = Arc::new(WsHub::new(Arc::new(ClientGate::new())));
        let state = Arc::new(NodeState::new("node-a", 60));

        let parsed = parse_log_line(TRAFFIC_LINE, "node-a", None).unwrap();
        let mut last_hint = None;
        handle_parsed_line(parsed, "node-a", &state, &db, &hub, &mut last_hint).await;
        assert_eq!(state.len().await, 1);
        assert!(state.is_dirty().await);

        db.flush().await;
        let conn = crate::db_utils::open_connection(&db_path, true).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
