/// Single-Writer Database Task
///
/// Sole process-wide writer. Drains a bounded bulk event queue and a
/// control queue of typed upsert commands. Events are batched (size or
/// interval triggered) and committed in one transaction; busy/locked
/// errors retry with capped exponential backoff; fatal storage errors
/// terminate the process.

use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};

use crate::config;
use crate::db::{self, RetentionPolicy};
use crate::db_utils::with_retry;
use crate::metrics;
use crate::types::{
    iso_micros, AlertRecord, BaselineStats, CompactionRecord, EarningsEstimate, InsightRecord,
    ReputationSample, StorageSnapshot, TrafficEvent,
};

/// Typed work submitted through the control queue
pub enum DbCommand {
    Compaction(CompactionRecord),
    Reputation(Vec<ReputationSample>),
    StorageSnapshot(StorageSnapshot),
    /// Confirmed write: the sender receives the new row id, or None
    Alert(AlertRecord, oneshot::Sender<Option<i64>>),
    AcknowledgeAlert(i64, oneshot::Sender<bool>),
    ResolveAlert(i64, oneshot::Sender<bool>),
    Insight(InsightRecord),
    Baseline {
        node_name: String,
        metric_name: String,
        window_hours: i64,
        stats: BaselineStats,
    },
    Earnings(EarningsEstimate),
    HourlyAggregate(Vec<String>),
    Prune(RetentionPolicy),
    /// Commit any pending event batch, then ack
    Flush(oneshot::Sender<()>),
}

/// Cloneable handle other components use to submit work
#[derive(Clone)]
pub struct DbHandle {
    pub db_path: String,
    event_tx: mpsc::Sender<TrafficEvent>,
    control_tx: mpsc::Sender<DbCommand>,
}

impl DbHandle {
    /// Fire-and-forget event submission. When the queue is full the event
    /// is dropped and counted; ordering of accepted events is preserved.
    pub fn submit_event(&self, event: TrafficEvent) {
        if self.event_tx.try_send(event).is_err() {
            metrics::EVENTS_DROPPED.inc();
            tracing::warn!("DB event queue full, dropping event");
        }
    }

    /// Submit a control command, waiting for queue capacity.
    pub async fn send(&self, command: DbCommand) {
        if self.control_tx.send(command).await.is_err() {
            tracing::error!("DB writer is gone, dropping control command");
        }
    }

    /// Persist an alert and wait for its row id.
    pub async fn write_alert(&self, alert: AlertRecord) -> Option<i64> {
        let (tx, rx) = oneshot::channel();
        self.send(DbCommand::Alert(alert, tx)).await;
        rx.await.ok().flatten()
    }

    /// Acknowledge an alert, confirmed.
    pub async fn acknowledge_alert(&self, alert_id: i64) -> bool {
        let (tx, rx) = oneshot::channel();
        self.send(DbCommand::AcknowledgeAlert(alert_id, tx)).await;
        rx.await.unwrap_or(false)
    }

    /// Resolve an alert, confirmed.
    pub async fn resolve_alert(&self, alert_id: i64) -> bool {
        let (tx, rx) = oneshot::channel();
        self.send(DbCommand::ResolveAlert(alert_id, tx)).await;
        rx.await.unwrap_or(false)
    }

    /// Handle wired to caller-supplied channels, for unit tests that do not
    /// want a live writer task.
    #[cfg(test)]
    pub(crate) fn for_tests(
        db_path: &str,
        event_tx: mpsc::Sender<TrafficEvent>,
        control_tx: mpsc::Sender<DbCommand>,
    ) -> Self {
        Self {
            db_path: db_path.to_string(),
            event_tx,
            control_tx,
        }
    }

    /// Commit everything currently queued. Used by shutdown and tests.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(DbCommand::Flush(tx)).await;
        let _ = rx.await;
    }
}

/// Fatal storage conditions that end the process (disk full, corruption)
fn is_fatal(err: &rusqlite::Error) -> bool {
    use rusqlite::ffi;
    match err {
        rusqlite::Error::SqliteFailure(e, _) => matches!(
            e.extended_code & 0xff,
            ffi::SQLITE_FULL | ffi::SQLITE_CORRUPT | ffi::SQLITE_NOTADB | ffi::SQLITE_IOERR
        ),
        _ => false,
    }
}

fn exit_on_fatal(err: &rusqlite::Error) {
    if is_fatal(err) {
        tracing::error!("fatal database error, terminating: {}", err);
        std::process::exit(1);
    }
}

async fn flush_batch(db_path: &str, batch: &mut Vec<TrafficEvent>) {
    if batch.is_empty() {
        return;
    }
    let events = std::mem::take(batch);
    let count = events.len();
    let path = db_path.to_string();
    let started = Instant::now();
    let result = tokio::task::spawn_blocking(move || {
        with_retry(|| db::write_event_batch(&path, &events))
    })
    .await;

    match result {
        Ok(Ok(written)) => {
            metrics::DB_BATCHES_COMMITTED.inc();
            metrics::DB_BATCH_SIZE.set(written as i64);
            metrics::DB_FLUSH_SECONDS.observe(started.elapsed().as_secs_f64());
            tracing::debug!(events = written, "committed event batch");
        }
        Ok(Err(err)) => {
            exit_on_fatal(&err);
            tracing::error!(events = count, "failed to commit event batch: {}", err);
        }
        Err(join_err) => {
            tracing::error!("event batch task panicked: {}", join_err);
        }
    }
}

async fn run_command(db_path: &str, command: DbCommand) {
    let path = db_path.to_string();
    match command {
        DbCommand::Compaction(record) => {
            let result = tokio::task::spawn_blocking(move || {
                with_retry(|| db::write_compaction_record(&path, &record))
            })
            .await;
            if let Ok(Err(err)) = result {
                exit_on_fatal(&err);
                tracing::error!("failed to write compaction record: {}", err);
            } else {
                metrics::COMPACTIONS_RECORDED.inc();
            }
        }
        DbCommand::Reputation(records) => {
            let result = tokio::task::spawn_blocking(move || {
                with_retry(|| db::write_reputation_history(&path, &records))
            })
            .await;
            if let Ok(Err(err)) = result {
                exit_on_fatal(&err);
                tracing::error!("failed to write reputation history: {}", err);
            }
        }
        DbCommand::StorageSnapshot(snapshot) => {
            let result = tokio::task::spawn_blocking(move || {
                with_retry(|| db::write_storage_snapshot(&path, &snapshot))
            })
            .await;
            if let Ok(Err(err)) = result {
                exit_on_fatal(&err);
                tracing::error!("failed to write storage snapshot: {}", err);
            }
        }
        DbCommand::Alert(alert, reply) => {
            let result = tokio::task::spawn_blocking(move || {
                with_retry(|| db::write_alert(&path, &alert))
            })
            .await;
            let row_id = match result {
                Ok(Ok(id)) => Some(id),
                Ok(Err(err)) => {
                    exit_on_fatal(&err);
                    tracing::error!("failed to write alert: {}", err);
                    None
                }
                Err(_) => None,
            };
            let _ = reply.send(row_id);
        }
        DbCommand::AcknowledgeAlert(alert_id, reply) => {
            let result = tokio::task::spawn_blocking(move || {
                with_retry(|| db::acknowledge_alert(&path, alert_id))
            })
            .await;
            let _ = reply.send(matches!(result, Ok(Ok(true))));
        }
        DbCommand::ResolveAlert(alert_id, reply) => {
            let result = tokio::task::spawn_blocking(move || {
                with_retry(|| db::resolve_alert(&path, alert_id))
            })
            .await;
            let _ = reply.send(matches!(result, Ok(Ok(true))));
        }
        DbCommand::Insight(insight) => {
            let result = tokio::task::spawn_blocking(move || {
                with_retry(|| db::write_insight(&path, &insight))
            })
            .await;
            if let Ok(Err(err)) = result {
                exit_on_fatal(&err);
                tracing::error!("failed to write insight: {}", err);
            }
        }
        DbCommand::Baseline {
            node_name,
            metric_name,
            window_hours,
            stats,
        } => {
            let result = tokio::task::spawn_blocking(move || {
                with_retry(|| db::update_baseline(&path, &node_name, &metric_name, window_hours, &stats))
            })
            .await;
            if let Ok(Err(err)) = result {
                exit_on_fatal(&err);
                tracing::error!("failed to update baseline: {}", err);
            }
        }
        DbCommand::Earnings(estimate) => {
            let result = tokio::task::spawn_blocking(move || {
                with_retry(|| db::write_earnings_estimate(&path, &estimate))
            })
            .await;
            if let Ok(Err(err)) = result {
                exit_on_fatal(&err);
                tracing::error!("failed to write earnings estimate: {}", err);
            }
        }
        DbCommand::HourlyAggregate(node_names) => {
            let result = tokio::task::spawn_blocking(move || {
                with_retry(|| db::hourly_aggregation(&path, &node_names))
            })
            .await;
            if let Ok(Err(err)) = result {
                exit_on_fatal(&err);
                tracing::error!("hourly aggregation failed: {}", err);
            }
        }
        DbCommand::Prune(policy) => {
            let stamp_path = path.clone();
            let result = tokio::task::spawn_blocking(move || {
                with_retry(|| db::prune(&path, &policy))
            })
            .await;
            match result {
                Ok(Ok(_)) => {
                    let now = iso_micros(&chrono::Utc::now());
                    let _ = tokio::task::spawn_blocking(move || {
                        db::set_persistent_state(&stamp_path, "last_prune_iso", &now)
                    })
                    .await;
                }
                Ok(Err(err)) => {
                    exit_on_fatal(&err);
                    tracing::error!("prune failed: {}", err);
                }
                Err(_) => {}
            }
        }
        DbCommand::Flush(reply) => {
            // Flushing of the event batch happens in the writer loop before
            // this command is handled; just acknowledge.
            let _ = reply.send(());
        }
    }
}

/// Start the writer task. Returns the shared handle.
pub fn start(db_path: String, mut shutdown: watch::Receiver<bool>) -> DbHandle {
    let (event_tx, mut event_rx) = mpsc::channel::<TrafficEvent>(config::db_queue_max_size());
    let (control_tx, mut control_rx) = mpsc::channel::<DbCommand>(256);

    let handle = DbHandle {
        db_path: db_path.clone(),
        event_tx,
        control_tx,
    };

    let live_batch_size = config::db_live_batch_size();
    let flush_interval = Duration::from_secs(config::db_write_batch_interval_seconds().max(1));

    tokio::spawn(async move {
        let mut batch: Vec<TrafficEvent> = Vec::new();
        let mut ticker = tokio::time::interval(flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                maybe_event = event_rx.recv() => {
                    match maybe_event {
                        Some(event) => {
                            batch.push(event);
                            if batch.len() >= live_batch_size {
                                flush_batch(&db_path, &mut batch).await;
                            }
                        }
                        None => break,
                    }
                }
                maybe_command = control_rx.recv() => {
                    match maybe_command {
                        Some(command) => {
                            if matches!(command, DbCommand::Flush(_)) {
                                // Pull in everything already queued so the ack
                                // really means "persisted up to this point".
                                while let Ok(event) = event_rx.try_recv() {
                                    batch.push(event);
                                }
                                flush_batch(&db_path, &mut batch).await;
                            }
                            run_command(&db_path, command).await;
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    flush_batch(&db_path, &mut batch).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        // Shutdown: drain whatever made it into the queues, commit, exit.
        while let Ok(event) = event_rx.try_recv() {
            batch.push(event);
        }
        flush_batch(&db_path, &mut batch).await;
        while let Ok(command) = control_rx.try_recv() {
            run_command(&db_path, command).await;
        }
        tracing::info!("DB writer task exited");
    });

    handle
}

#[cfg(test)]
mod db_writer_tests {
    use super::*;
    use crate::db;
    use chrono::Utc;
    use tempfile::TempDir;

    fn test_event(node: &str) -> TrafficEvent {
        let ts = Utc::now();
        TrafficEvent {
            timestamp: ts,
            ts_unix: ts.timestamp_micros() as f64 / 1e6,
            action: "GET".to_string(),
            status: crate::types::EventStatus::Success,
            size: 64,
            piece_id: None,
            satellite_id: "sat".to_string(),
            remote_ip: None,
            location: crate::types::Location::default(),
            error_reason: None,
            node_name: node.to_string(),
            duration_ms: None,
            category: crate::types::TrafficCategory::Get,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_events_flush_on_demand() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w.db").to_str().unwrap().to_string();
        db::init_db(&path).unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = start(path.clone(), shutdown_rx);

        for _ in 0..5 {
            handle.submit_event(test_event("n"));
        }
        handle.flush().await;

        let conn = crate::db_utils::open_connection(&path, true).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_alert_write_returns_row_id() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("w2.db").to_str().unwrap().to_string();
        db::init_db(&path).unwrap();

        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = start(path.clone(), shutdown_rx);

        let alert = AlertRecord {
            timestamp: Utc::now(),
            node_name: "n".to_string(),
            alert_type: "latency_warning".to_string(),
            severity: crate::types::Severity::Warning,
            title: "High Latency".to_string(),
            message: "P99 latency is elevated.".to_string(),
            metadata: serde_json::json!({}),
        };
        let id = handle.write_alert(alert).await;
        assert!(id.is_some());
        assert!(handle.acknowledge_alert(id.unwrap()).await);
    }
}
