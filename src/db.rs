/// Embedded Database Layer
///
/// Schema creation with lazy forward migrations, batched event inserts,
/// pruning, hourly aggregation and every row-level query the monitor runs.
/// All functions here are blocking and open their own short-lived
/// connection; the writer task is the only caller of the write paths.

use chrono::{DateTime, Duration, Timelike, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection};
use serde_json::{json, Value};

use crate::db_utils::open_connection;
use crate::parser::categorize_action;
use crate::types::{
    iso_micros, AlertRecord, BaselineStats, CompactionRecord, EarningsEstimate, EventStatus,
    InsightRecord, Location, ReputationSample, StorageSnapshot, TrafficEvent,
};

/// Create tables, indexes, and run lazy migrations on legacy schemas.
pub fn init_db(db_path: &str) -> rusqlite::Result<()> {
    tracing::info!("connecting to database and checking schema");
    let conn = open_connection(db_path, false)?;

    let mode: String = conn.query_row("PRAGMA journal_mode;", [], |row| row.get(0))?;
    if mode.eq_ignore_ascii_case("wal") {
        tracing::info!("database journal mode is WAL");
    } else {
        tracing::warn!("failed to set journal mode to WAL, current mode: {}", mode);
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS hashstore_compaction_history (
            node_name TEXT NOT NULL,
            satellite TEXT NOT NULL,
            store TEXT NOT NULL,
            last_run_iso TEXT NOT NULL,
            duration REAL,
            data_reclaimed_bytes INTEGER,
            data_rewritten_bytes INTEGER,
            table_load REAL,
            trash_percent REAL,
            PRIMARY KEY (node_name, satellite, store, last_run_iso)
        );",
    )?;

    migrate_events_table(&conn)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (
            id INTEGER PRIMARY KEY,
            timestamp DATETIME,
            action TEXT,
            status TEXT,
            size INTEGER,
            piece_id TEXT,
            satellite_id TEXT,
            remote_ip TEXT,
            country TEXT,
            latitude REAL,
            longitude REAL,
            error_reason TEXT,
            node_name TEXT,
            duration_ms INTEGER
        );",
    )?;

    migrate_hourly_stats_table(&conn)?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS hourly_stats (
            hour_timestamp TEXT,
            node_name TEXT,
            dl_success INTEGER DEFAULT 0,
            dl_fail INTEGER DEFAULT 0,
            ul_success INTEGER DEFAULT 0,
            ul_fail INTEGER DEFAULT 0,
            audit_success INTEGER DEFAULT 0,
            audit_fail INTEGER DEFAULT 0,
            total_download_size INTEGER DEFAULT 0,
            total_upload_size INTEGER DEFAULT 0,
            PRIMARY KEY (hour_timestamp, node_name)
        );
        CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events (timestamp);
        CREATE INDEX IF NOT EXISTS idx_events_node_name ON events (node_name);
        CREATE TABLE IF NOT EXISTS app_persistent_state (key TEXT PRIMARY KEY, value TEXT);",
    )?;

    // Composite index that carries the hourly aggregation query
    let have_composite: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='index' AND name='idx_events_node_name_timestamp'",
            [],
            |_| Ok(true),
        )
        .unwrap_or(false);
    if !have_composite {
        tracing::info!("creating composite events index, this may take a while on large databases");
        conn.execute_batch(
            "CREATE INDEX idx_events_node_name_timestamp ON events (node_name, timestamp);",
        )?;
    }

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS reputation_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp DATETIME NOT NULL,
            node_name TEXT NOT NULL,
            satellite TEXT NOT NULL,
            audit_score REAL,
            suspension_score REAL,
            online_score REAL,
            audit_success_count INTEGER,
            audit_total_count INTEGER,
            is_disqualified INTEGER DEFAULT 0,
            is_suspended INTEGER DEFAULT 0
        );
        CREATE INDEX IF NOT EXISTS idx_reputation_node_time ON reputation_history (node_name, timestamp);
        CREATE INDEX IF NOT EXISTS idx_reputation_satellite ON reputation_history (satellite);

        CREATE TABLE IF NOT EXISTS storage_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp DATETIME NOT NULL,
            node_name TEXT NOT NULL,
            total_bytes INTEGER,
            used_bytes INTEGER,
            available_bytes INTEGER,
            trash_bytes INTEGER,
            used_percent REAL,
            trash_percent REAL,
            available_percent REAL
        );
        CREATE INDEX IF NOT EXISTS idx_storage_node_time ON storage_snapshots (node_name, timestamp);

        CREATE TABLE IF NOT EXISTS alerts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp DATETIME NOT NULL,
            node_name TEXT NOT NULL,
            alert_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            title TEXT NOT NULL,
            message TEXT NOT NULL,
            acknowledged INTEGER DEFAULT 0,
            acknowledged_at DATETIME,
            resolved INTEGER DEFAULT 0,
            resolved_at DATETIME,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_alerts_node_time ON alerts (node_name, timestamp);
        CREATE INDEX IF NOT EXISTS idx_alerts_active ON alerts (acknowledged, resolved, timestamp);
        CREATE INDEX IF NOT EXISTS idx_alerts_severity ON alerts (severity, timestamp);

        CREATE TABLE IF NOT EXISTS insights (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp DATETIME NOT NULL,
            node_name TEXT NOT NULL,
            insight_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT NOT NULL,
            category TEXT,
            confidence REAL,
            acknowledged INTEGER DEFAULT 0,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_insights_node_time ON insights (node_name, timestamp);
        CREATE INDEX IF NOT EXISTS idx_insights_type ON insights (insight_type, timestamp);

        CREATE TABLE IF NOT EXISTS analytics_baselines (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            node_name TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            window_hours INTEGER NOT NULL,
            mean_value REAL,
            std_dev REAL,
            min_value REAL,
            max_value REAL,
            sample_count INTEGER,
            last_updated DATETIME NOT NULL,
            UNIQUE(node_name, metric_name, window_hours)
        );
        CREATE INDEX IF NOT EXISTS idx_baselines_node_metric ON analytics_baselines (node_name, metric_name);

        CREATE TABLE IF NOT EXISTS earnings_estimates (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp DATETIME NOT NULL,
            node_name TEXT NOT NULL,
            satellite TEXT NOT NULL,
            period TEXT NOT NULL,
            egress_bytes INTEGER DEFAULT 0,
            egress_earnings_gross REAL DEFAULT 0,
            egress_earnings_net REAL DEFAULT 0,
            storage_bytes_hour INTEGER DEFAULT 0,
            storage_earnings_gross REAL DEFAULT 0,
            storage_earnings_net REAL DEFAULT 0,
            repair_bytes INTEGER DEFAULT 0,
            repair_earnings_gross REAL DEFAULT 0,
            repair_earnings_net REAL DEFAULT 0,
            audit_bytes INTEGER DEFAULT 0,
            audit_earnings_gross REAL DEFAULT 0,
            audit_earnings_net REAL DEFAULT 0,
            total_earnings_gross REAL DEFAULT 0,
            total_earnings_net REAL DEFAULT 0,
            held_amount REAL DEFAULT 0,
            node_age_months INTEGER,
            held_percentage REAL,
            is_finalized INTEGER DEFAULT 0,
            UNIQUE(node_name, satellite, period)
        );
        CREATE INDEX IF NOT EXISTS idx_earnings_node_period ON earnings_estimates (node_name, period);",
    )?;

    tracing::info!("database schema is valid and ready");
    Ok(())
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({});", table))?;
    let cols = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(cols)
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    Ok(conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type='table' AND name=?1",
            params![table],
            |_| Ok(()),
        )
        .map(|_| true)
        .unwrap_or(false))
}

fn migrate_events_table(conn: &Connection) -> rusqlite::Result<()> {
    if !table_exists(conn, "events")? {
        return Ok(());
    }
    let columns = table_columns(conn, "events")?;
    if !columns.iter().any(|c| c == "node_name") {
        tracing::info!("upgrading 'events' table: adding 'node_name' column");
        conn.execute_batch(
            "ALTER TABLE events ADD COLUMN node_name TEXT;
             UPDATE events SET node_name = 'default' WHERE node_name IS NULL;",
        )?;
    }
    if !columns.iter().any(|c| c == "duration_ms") {
        tracing::info!("upgrading 'events' table: adding 'duration_ms' column");
        conn.execute_batch("ALTER TABLE events ADD COLUMN duration_ms INTEGER;")?;
    }
    Ok(())
}

fn migrate_hourly_stats_table(conn: &Connection) -> rusqlite::Result<()> {
    if !table_exists(conn, "hourly_stats")? {
        return Ok(());
    }
    let columns = table_columns(conn, "hourly_stats")?;
    if !columns.iter().any(|c| c == "node_name") {
        tracing::info!("upgrading 'hourly_stats' table: rebuilding with composite primary key");
        let dl_size = if columns.iter().any(|c| c == "total_download_size") {
            "total_download_size"
        } else {
            "0 as total_download_size"
        };
        let ul_size = if columns.iter().any(|c| c == "total_upload_size") {
            "total_upload_size"
        } else {
            "0 as total_upload_size"
        };
        conn.execute_batch(&format!(
            "ALTER TABLE hourly_stats RENAME TO hourly_stats_old;
             CREATE TABLE hourly_stats (
                 hour_timestamp TEXT, node_name TEXT,
                 dl_success INTEGER DEFAULT 0, dl_fail INTEGER DEFAULT 0,
                 ul_success INTEGER DEFAULT 0, ul_fail INTEGER DEFAULT 0,
                 audit_success INTEGER DEFAULT 0, audit_fail INTEGER DEFAULT 0,
                 total_download_size INTEGER DEFAULT 0, total_upload_size INTEGER DEFAULT 0,
                 PRIMARY KEY (hour_timestamp, node_name));
             INSERT INTO hourly_stats
                 SELECT hour_timestamp, 'default' as node_name, dl_success, dl_fail,
                        ul_success, ul_fail, audit_success, audit_fail, {}, {}
                 FROM hourly_stats_old;
             DROP TABLE hourly_stats_old;",
            dl_size, ul_size
        ))?;
    } else {
        if !columns.iter().any(|c| c == "total_download_size") {
            conn.execute_batch(
                "ALTER TABLE hourly_stats ADD COLUMN total_download_size INTEGER DEFAULT 0;",
            )?;
        }
        if !columns.iter().any(|c| c == "total_upload_size") {
            conn.execute_batch(
                "ALTER TABLE hourly_stats ADD COLUMN total_upload_size INTEGER DEFAULT 0;",
            )?;
        }
    }
    Ok(())
}

/// Insert a batch of traffic events in one transaction. Either every row in
/// the batch commits or none do.
pub fn write_event_batch(db_path: &str, events: &[TrafficEvent]) -> rusqlite::Result<usize> {
    if events.is_empty() {
        return Ok(0);
    }
    let mut conn = open_connection(db_path, false)?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO events (timestamp, action, status, size, piece_id, satellite_id,
                                 remote_ip, country, latitude, longitude, error_reason,
                                 node_name, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        )?;
        for e in events {
            stmt.execute(params![
                iso_micros(&e.timestamp),
                e.action,
                e.status.as_str(),
                e.size,
                e.piece_id,
                e.satellite_id,
                e.remote_ip,
                e.location.country,
                e.location.lat,
                e.location.lon,
                e.error_reason,
                e.node_name,
                e.duration_ms,
            ])?;
        }
    }
    tx.commit()?;
    Ok(events.len())
}

/// Persist one finished compaction. The identity columns form the primary
/// key, so a replayed line overwrites rather than duplicates.
pub fn write_compaction_record(db_path: &str, record: &CompactionRecord) -> rusqlite::Result<()> {
    let conn = open_connection(db_path, false)?;
    conn.execute(
        "INSERT OR REPLACE INTO hashstore_compaction_history
         (node_name, satellite, store, last_run_iso, duration, data_reclaimed_bytes,
          data_rewritten_bytes, table_load, trash_percent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            record.node_name,
            record.satellite,
            record.store,
            record.last_run_iso,
            record.duration,
            record.data_reclaimed_bytes,
            record.data_rewritten_bytes,
            record.table_load,
            record.trash_percent,
        ],
    )?;
    Ok(())
}

/// Bulk-ingest variant: existing identical runs are left alone.
pub fn write_compaction_batch(db_path: &str, records: &[CompactionRecord]) -> rusqlite::Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut conn = open_connection(db_path, false)?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO hashstore_compaction_history
             (node_name, satellite, store, last_run_iso, duration, data_reclaimed_bytes,
              data_rewritten_bytes, table_load, trash_percent)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        for r in records {
            stmt.execute(params![
                r.node_name,
                r.satellite,
                r.store,
                r.last_run_iso,
                r.duration,
                r.data_reclaimed_bytes,
                r.data_rewritten_bytes,
                r.table_load,
                r.trash_percent,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

/// Floor a timestamp to the start of its hour
pub fn truncate_to_hour(dt: DateTime<Utc>) -> DateTime<Utc> {
    dt.with_minute(0)
        .and_then(|d| d.with_second(0))
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt)
}

const HOURLY_CASE_COLUMNS: &str = "
    SUM(CASE WHEN action LIKE '%GET%' AND status = 'success' AND action != 'GET_AUDIT' THEN 1 ELSE 0 END) as dl_s,
    SUM(CASE WHEN action LIKE '%GET%' AND status != 'success' AND action != 'GET_AUDIT' THEN 1 ELSE 0 END) as dl_f,
    SUM(CASE WHEN action LIKE '%PUT%' AND status = 'success' THEN 1 ELSE 0 END) as ul_s,
    SUM(CASE WHEN action LIKE '%PUT%' AND status != 'success' THEN 1 ELSE 0 END) as ul_f,
    SUM(CASE WHEN action = 'GET_AUDIT' AND status = 'success' THEN 1 ELSE 0 END) as audit_s,
    SUM(CASE WHEN action = 'GET_AUDIT' AND status != 'success' THEN 1 ELSE 0 END) as audit_f,
    SUM(CASE WHEN action LIKE '%GET%' AND status = 'success' AND action != 'GET_AUDIT' THEN size ELSE 0 END) as total_dl_size,
    SUM(CASE WHEN action LIKE '%PUT%' AND status = 'success' THEN size ELSE 0 END) as total_ul_size";

/// Aggregate the current hour bucket for each node and upsert into
/// `hourly_stats`.
pub fn hourly_aggregation(db_path: &str, node_names: &[String]) -> rusqlite::Result<()> {
    tracing::info!("running hourly aggregation");
    let now = Utc::now();
    let hour_start = truncate_to_hour(now);
    let hour_start_iso = iso_micros(&hour_start);
    let next_hour_iso = iso_micros(&(hour_start + Duration::hours(1)));

    let conn = open_connection(db_path, false)?;
    for node_name in node_names {
        let query = format!(
            "SELECT {} FROM events WHERE node_name = ?1 AND timestamp >= ?2 AND timestamp < ?3",
            HOURLY_CASE_COLUMNS
        );
        let row: Option<(i64, i64, i64, i64, i64, i64, i64, i64)> = conn
            .query_row(
                &query,
                params![node_name, hour_start_iso, next_hour_iso],
                |row| {
                    let dl_s: Option<i64> = row.get(0)?;
                    match dl_s {
                        None => Ok(None),
                        Some(dl_s) => Ok(Some((
                            dl_s,
                            row.get(1)?,
                            row.get(2)?,
                            row.get(3)?,
                            row.get(4)?,
                            row.get(5)?,
                            row.get(6)?,
                            row.get(7)?,
                        ))),
                    }
                },
            )
            .unwrap_or(None);

        if let Some((dl_s, dl_f, ul_s, ul_f, audit_s, audit_f, dl_size, ul_size)) = row {
            conn.execute(
                "INSERT INTO hourly_stats (hour_timestamp, node_name, dl_success, dl_fail,
                     ul_success, ul_fail, audit_success, audit_fail,
                     total_download_size, total_upload_size)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(hour_timestamp, node_name) DO UPDATE SET
                     dl_success=excluded.dl_success, dl_fail=excluded.dl_fail,
                     ul_success=excluded.ul_success, ul_fail=excluded.ul_fail,
                     audit_success=excluded.audit_success, audit_fail=excluded.audit_fail,
                     total_download_size=excluded.total_download_size,
                     total_upload_size=excluded.total_upload_size",
                params![
                    hour_start_iso, node_name, dl_s, dl_f, ul_s, ul_f, audit_s, audit_f, dl_size,
                    ul_size
                ],
            )?;
            tracing::info!(node = node_name.as_str(), hour = hour_start_iso.as_str(), "wrote hourly stats");
        }
    }
    Ok(())
}

/// Backfill hourly stats for every hour since the last stored bucket (or
/// the earliest event). One GROUP BY does all the work; running it twice
/// produces identical rows.
pub fn backfill_hourly_stats(db_path: &str) -> rusqlite::Result<usize> {
    tracing::info!("starting backfill of hourly statistics");
    let conn = open_connection(db_path, false)?;

    let last_hour: Option<String> =
        conn.query_row("SELECT MAX(hour_timestamp) FROM hourly_stats", [], |row| {
            row.get(0)
        })?;

    let start_from_iso = match last_hour {
        Some(hour) => hour,
        None => {
            let earliest: Option<String> =
                conn.query_row("SELECT MIN(timestamp) FROM events", [], |row| row.get(0))?;
            match earliest {
                None => {
                    tracing::info!("no events found, skipping backfill");
                    return Ok(0);
                }
                Some(ts) => match DateTime::parse_from_rfc3339(&ts) {
                    Ok(dt) => iso_micros(&truncate_to_hour(dt.with_timezone(&Utc))),
                    Err(_) => ts,
                },
            }
        }
    };

    let query = format!(
        "SELECT strftime('%Y-%m-%dT%H:00:00.000Z', timestamp) as hour_timestamp, node_name, {}
         FROM events WHERE timestamp >= ?1 GROUP BY hour_timestamp, node_name",
        HOURLY_CASE_COLUMNS
    );
    let mut stmt = conn.prepare(&query)?;
    let rows: Vec<(String, String, i64, i64, i64, i64, i64, i64, i64, i64)> = stmt
        .query_map(params![start_from_iso], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                row.get::<_, Option<i64>>(7)?.unwrap_or(0),
                row.get::<_, Option<i64>>(8)?.unwrap_or(0),
                row.get::<_, Option<i64>>(9)?.unwrap_or(0),
            ))
        })?
        .filter_map(|r| r.ok())
        .collect();
    drop(stmt);

    if rows.is_empty() {
        tracing::info!("no new events to aggregate, backfill complete");
        return Ok(0);
    }

    let written = rows.len();
    let mut insert = conn.prepare(
        "INSERT OR REPLACE INTO hourly_stats
         (hour_timestamp, node_name, dl_success, dl_fail, ul_success, ul_fail,
          audit_success, audit_fail, total_download_size, total_upload_size)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )?;
    for r in &rows {
        insert.execute(params![r.0, r.1, r.2, r.3, r.4, r.5, r.6, r.7, r.8, r.9])?;
    }
    tracing::info!(records = written, "hourly statistics backfill complete");
    Ok(written)
}

/// Retention windows for pruning, in days per table
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    pub events_days: i64,
    pub hashstore_days: i64,
    pub alerts_days: i64,
    pub insights_days: i64,
    pub baselines_days: i64,
    pub earnings_days: i64,
}

impl RetentionPolicy {
    pub fn from_config() -> Self {
        Self {
            events_days: crate::config::events_retention_days(),
            hashstore_days: crate::config::hashstore_retention_days(),
            alerts_days: crate::config::alerts_retention_days(),
            insights_days: crate::config::insights_retention_days(),
            baselines_days: crate::config::baselines_retention_days(),
            earnings_days: crate::config::earnings_retention_days(),
        }
    }
}

/// Delete rows older than the per-table retention windows. Returns the
/// number of deleted event rows.
pub fn prune(db_path: &str, policy: &RetentionPolicy) -> rusqlite::Result<usize> {
    let now = Utc::now();
    let cutoff = |days: i64| iso_micros(&(now - Duration::days(days)));
    let conn = open_connection(db_path, false)?;

    let events_deleted = conn.execute(
        "DELETE FROM events WHERE timestamp < ?1",
        params![cutoff(policy.events_days)],
    )?;
    if events_deleted > 0 {
        tracing::info!(deleted = events_deleted, "pruned old events");
    }
    let hashstore_deleted = conn.execute(
        "DELETE FROM hashstore_compaction_history WHERE last_run_iso < ?1",
        params![cutoff(policy.hashstore_days)],
    )?;
    if hashstore_deleted > 0 {
        tracing::info!(deleted = hashstore_deleted, "pruned old compaction records");
    }
    conn.execute(
        "DELETE FROM alerts WHERE timestamp < ?1",
        params![cutoff(policy.alerts_days)],
    )?;
    conn.execute(
        "DELETE FROM insights WHERE timestamp < ?1",
        params![cutoff(policy.insights_days)],
    )?;
    conn.execute(
        "DELETE FROM analytics_baselines WHERE last_updated < ?1",
        params![cutoff(policy.baselines_days)],
    )?;
    conn.execute(
        "DELETE FROM earnings_estimates WHERE timestamp < ?1",
        params![cutoff(policy.earnings_days)],
    )?;
    Ok(events_deleted)
}

fn in_placeholders(n: usize) -> String {
    (0..n)
        .map(|i| format!("?{}", i + 1))
        .collect::<Vec<_>>()
        .join(",")
}

/// Summed hourly stats per bucket for a set of nodes, newest first, with
/// Mbps derived from the byte totals.
pub fn get_historical_stats(
    db_path: &str,
    node_names: &[String],
    limit_hours: i64,
) -> rusqlite::Result<Vec<Value>> {
    if node_names.is_empty() {
        return Ok(vec![]);
    }
    let conn = open_connection(db_path, true)?;
    let query = format!(
        "SELECT hour_timestamp,
                SUM(dl_success) as dl_success, SUM(dl_fail) as dl_fail,
                SUM(ul_success) as ul_success, SUM(ul_fail) as ul_fail,
                SUM(audit_success) as audit_success, SUM(audit_fail) as audit_fail,
                SUM(total_download_size) as total_download_size,
                SUM(total_upload_size) as total_upload_size
         FROM hourly_stats WHERE node_name IN ({})
         GROUP BY hour_timestamp ORDER BY hour_timestamp DESC LIMIT ?{}",
        in_placeholders(node_names.len()),
        node_names.len() + 1
    );
    let mut sql_params: Vec<SqlValue> = node_names
        .iter()
        .map(|n| SqlValue::Text(n.clone()))
        .collect();
    sql_params.push(SqlValue::Integer(limit_hours));

    let mut stmt = conn.prepare(&query)?;
    let rows = stmt
        .query_map(params_from_iter(sql_params.iter()), |row| {
            let dl_size: i64 = row.get::<_, Option<i64>>(7)?.unwrap_or(0);
            let ul_size: i64 = row.get::<_, Option<i64>>(8)?.unwrap_or(0);
            Ok(json!({
                "hour_timestamp": row.get::<_, String>(0)?,
                "dl_success": row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                "dl_fail": row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                "ul_success": row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                "ul_fail": row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                "audit_success": row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                "audit_fail": row.get::<_, Option<i64>>(6)?.unwrap_or(0),
                "total_download_size": dl_size,
                "total_upload_size": ul_size,
                "dl_mbps": (dl_size as f64 * 8.0) / (3600.0 * 1e6),
                "ul_mbps": (ul_size as f64 * 8.0) / (3600.0 * 1e6),
            }))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Compaction history rows matching optional node/satellite/store filters,
/// newest first.
pub fn get_hashstore_stats(
    db_path: &str,
    node_names: Option<&[String]>,
    satellite: Option<&str>,
    store: Option<&str>,
) -> rusqlite::Result<Vec<Value>> {
    let conn = open_connection(db_path, true)?;

    let mut clauses: Vec<String> = Vec::new();
    let mut sql_params: Vec<SqlValue> = Vec::new();
    if let Some(names) = node_names {
        if names.is_empty() {
            return Ok(vec![]);
        }
        let ph: Vec<String> = names
            .iter()
            .map(|n| {
                sql_params.push(SqlValue::Text(n.clone()));
                format!("?{}", sql_params.len())
            })
            .collect();
        clauses.push(format!("node_name IN ({})", ph.join(",")));
    }
    if let Some(sat) = satellite {
        sql_params.push(SqlValue::Text(sat.to_string()));
        clauses.push(format!("satellite = ?{}", sql_params.len()));
    }
    if let Some(store) = store {
        sql_params.push(SqlValue::Text(store.to_string()));
        clauses.push(format!("store = ?{}", sql_params.len()));
    }

    let mut query = String::from(
        "SELECT node_name, satellite, store, last_run_iso, duration, data_reclaimed_bytes,
                data_rewritten_bytes, table_load, trash_percent
         FROM hashstore_compaction_history",
    );
    if !clauses.is_empty() {
        query.push_str(" WHERE ");
        query.push_str(&clauses.join(" AND "));
    }
    query.push_str(" ORDER BY last_run_iso DESC");

    let mut stmt = conn.prepare(&query)?;
    let rows = stmt
        .query_map(params_from_iter(sql_params.iter()), |row| {
            Ok(json!({
                "node_name": row.get::<_, String>(0)?,
                "satellite": row.get::<_, String>(1)?,
                "store": row.get::<_, String>(2)?,
                "last_run_iso": row.get::<_, String>(3)?,
                "duration": row.get::<_, Option<f64>>(4)?,
                "data_reclaimed_bytes": row.get::<_, Option<i64>>(5)?,
                "data_rewritten_bytes": row.get::<_, Option<i64>>(6)?,
                "table_load": row.get::<_, Option<f64>>(7)?,
                "trash_percent": row.get::<_, Option<f64>>(8)?,
            }))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Write a batch of reputation samples.
pub fn write_reputation_history(
    db_path: &str,
    records: &[ReputationSample],
) -> rusqlite::Result<()> {
    if records.is_empty() {
        return Ok(());
    }
    let mut conn = open_connection(db_path, false)?;
    let tx = conn.transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO reputation_history
             (timestamp, node_name, satellite, audit_score, suspension_score, online_score,
              audit_success_count, audit_total_count, is_disqualified, is_suspended)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        )?;
        for r in records {
            stmt.execute(params![
                iso_micros(&r.timestamp),
                r.node_name,
                r.satellite,
                r.audit_score,
                r.suspension_score,
                r.online_score,
                r.audit_success_count,
                r.audit_total_count,
                r.is_disqualified as i64,
                r.is_suspended as i64,
            ])?;
        }
    }
    tx.commit()?;
    Ok(())
}

fn reputation_row_to_json(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, i64>(0)?,
        "timestamp": row.get::<_, String>(1)?,
        "node_name": row.get::<_, String>(2)?,
        "satellite": row.get::<_, String>(3)?,
        "audit_score": row.get::<_, Option<f64>>(4)?,
        "suspension_score": row.get::<_, Option<f64>>(5)?,
        "online_score": row.get::<_, Option<f64>>(6)?,
        "audit_success_count": row.get::<_, Option<i64>>(7)?,
        "audit_total_count": row.get::<_, Option<i64>>(8)?,
        "is_disqualified": row.get::<_, Option<i64>>(9)?.unwrap_or(0) != 0,
        "is_suspended": row.get::<_, Option<i64>>(10)?.unwrap_or(0) != 0,
    }))
}

/// Most recent reputation row per (node, satellite).
pub fn get_latest_reputation(db_path: &str, node_names: &[String]) -> rusqlite::Result<Vec<Value>> {
    if node_names.is_empty() {
        return Ok(vec![]);
    }
    let conn = open_connection(db_path, true)?;
    let query = format!(
        "SELECT r1.id, r1.timestamp, r1.node_name, r1.satellite, r1.audit_score,
                r1.suspension_score, r1.online_score, r1.audit_success_count,
                r1.audit_total_count, r1.is_disqualified, r1.is_suspended
         FROM reputation_history r1
         INNER JOIN (
             SELECT node_name, satellite, MAX(timestamp) as max_timestamp
             FROM reputation_history
             WHERE node_name IN ({})
             GROUP BY node_name, satellite
         ) r2 ON r1.node_name = r2.node_name
             AND r1.satellite = r2.satellite
             AND r1.timestamp = r2.max_timestamp
         ORDER BY r1.node_name, r1.satellite",
        in_placeholders(node_names.len())
    );
    let sql_params: Vec<SqlValue> = node_names
        .iter()
        .map(|n| SqlValue::Text(n.clone()))
        .collect();
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt
        .query_map(params_from_iter(sql_params.iter()), |row| {
            reputation_row_to_json(row)
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Reputation history for a node, oldest first.
pub fn get_reputation_history(
    db_path: &str,
    node_name: &str,
    satellite: Option<&str>,
    hours: i64,
) -> rusqlite::Result<Vec<Value>> {
    let cutoff = iso_micros(&(Utc::now() - Duration::hours(hours)));
    let conn = open_connection(db_path, true)?;
    let mut rows = Vec::new();
    match satellite {
        Some(sat) => {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, node_name, satellite, audit_score, suspension_score,
                        online_score, audit_success_count, audit_total_count,
                        is_disqualified, is_suspended
                 FROM reputation_history
                 WHERE node_name = ?1 AND satellite = ?2 AND timestamp >= ?3
                 ORDER BY timestamp ASC",
            )?;
            let mapped = stmt.query_map(params![node_name, sat, cutoff], |row| {
                reputation_row_to_json(row)
            })?;
            for r in mapped {
                if let Ok(v) = r {
                    rows.push(v);
                }
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT id, timestamp, node_name, satellite, audit_score, suspension_score,
                        online_score, audit_success_count, audit_total_count,
                        is_disqualified, is_suspended
                 FROM reputation_history
                 WHERE node_name = ?1 AND timestamp >= ?2
                 ORDER BY timestamp ASC, satellite",
            )?;
            let mapped = stmt.query_map(params![node_name, cutoff], |row| {
                reputation_row_to_json(row)
            })?;
            for r in mapped {
                if let Ok(v) = r {
                    rows.push(v);
                }
            }
        }
    }
    Ok(rows)
}

/// Write one storage snapshot. Partial (log-derived) snapshots leave
/// unknown columns NULL.
pub fn write_storage_snapshot(db_path: &str, snapshot: &StorageSnapshot) -> rusqlite::Result<()> {
    let conn = open_connection(db_path, false)?;
    conn.execute(
        "INSERT INTO storage_snapshots
         (timestamp, node_name, total_bytes, used_bytes, available_bytes, trash_bytes,
          used_percent, trash_percent, available_percent)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            iso_micros(&snapshot.timestamp),
            snapshot.node_name,
            snapshot.total_bytes,
            snapshot.used_bytes,
            snapshot.available_bytes,
            snapshot.trash_bytes,
            snapshot.used_percent,
            snapshot.trash_percent,
            snapshot.available_percent,
        ],
    )?;
    Ok(())
}

fn storage_row_to_json(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "id": row.get::<_, i64>(0)?,
        "timestamp": row.get::<_, String>(1)?,
        "node_name": row.get::<_, String>(2)?,
        "total_bytes": row.get::<_, Option<i64>>(3)?,
        "used_bytes": row.get::<_, Option<i64>>(4)?,
        "available_bytes": row.get::<_, Option<i64>>(5)?,
        "trash_bytes": row.get::<_, Option<i64>>(6)?,
        "used_percent": row.get::<_, Option<f64>>(7)?,
        "trash_percent": row.get::<_, Option<f64>>(8)?,
        "available_percent": row.get::<_, Option<f64>>(9)?,
    }))
}

const STORAGE_COLUMNS: &str = "id, timestamp, node_name, total_bytes, used_bytes, \
     available_bytes, trash_bytes, used_percent, trash_percent, available_percent";

/// Storage snapshots for a node over the last `days`, oldest first.
pub fn get_storage_history(
    db_path: &str,
    node_name: &str,
    days: i64,
) -> rusqlite::Result<Vec<Value>> {
    let cutoff = iso_micros(&(Utc::now() - Duration::days(days)));
    let conn = open_connection(db_path, true)?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM storage_snapshots
         WHERE node_name = ?1 AND timestamp >= ?2 ORDER BY timestamp ASC",
        STORAGE_COLUMNS
    ))?;
    let rows = stmt
        .query_map(params![node_name, cutoff], |row| storage_row_to_json(row))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Most recent storage snapshot per node.
pub fn get_latest_storage(db_path: &str, node_names: &[String]) -> rusqlite::Result<Vec<Value>> {
    if node_names.is_empty() {
        return Ok(vec![]);
    }
    let conn = open_connection(db_path, true)?;
    let query = format!(
        "SELECT s1.id, s1.timestamp, s1.node_name, s1.total_bytes, s1.used_bytes,
                s1.available_bytes, s1.trash_bytes, s1.used_percent, s1.trash_percent,
                s1.available_percent
         FROM storage_snapshots s1
         INNER JOIN (
             SELECT node_name, MAX(timestamp) as max_timestamp
             FROM storage_snapshots WHERE node_name IN ({})
             GROUP BY node_name
         ) s2 ON s1.node_name = s2.node_name AND s1.timestamp = s2.max_timestamp
         ORDER BY s1.node_name",
        in_placeholders(node_names.len())
    );
    let sql_params: Vec<SqlValue> = node_names
        .iter()
        .map(|n| SqlValue::Text(n.clone()))
        .collect();
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt
        .query_map(params_from_iter(sql_params.iter()), |row| {
            storage_row_to_json(row)
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Persist an alert, returning its row id.
pub fn write_alert(db_path: &str, alert: &AlertRecord) -> rusqlite::Result<i64> {
    let conn = open_connection(db_path, false)?;
    conn.execute(
        "INSERT INTO alerts (timestamp, node_name, alert_type, severity, title, message, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            iso_micros(&alert.timestamp),
            alert.node_name,
            alert.alert_type,
            alert.severity.as_str(),
            alert.title,
            alert.message,
            alert.metadata.to_string(),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn alert_row_to_json(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    let metadata: Option<String> = row.get(11)?;
    let metadata = metadata
        .and_then(|m| serde_json::from_str(&m).ok())
        .unwrap_or(Value::Null);
    Ok(json!({
        "id": row.get::<_, i64>(0)?,
        "timestamp": row.get::<_, String>(1)?,
        "node_name": row.get::<_, String>(2)?,
        "alert_type": row.get::<_, String>(3)?,
        "severity": row.get::<_, String>(4)?,
        "title": row.get::<_, String>(5)?,
        "message": row.get::<_, String>(6)?,
        "acknowledged": row.get::<_, Option<i64>>(7)?.unwrap_or(0) != 0,
        "acknowledged_at": row.get::<_, Option<String>>(8)?,
        "resolved": row.get::<_, Option<i64>>(9)?.unwrap_or(0) != 0,
        "resolved_at": row.get::<_, Option<String>>(10)?,
        "metadata": metadata,
    }))
}

const ALERT_COLUMNS: &str = "id, timestamp, node_name, alert_type, severity, title, message, \
     acknowledged, acknowledged_at, resolved, resolved_at, metadata";

/// Unacknowledged, unresolved alerts, newest first.
pub fn get_active_alerts(
    db_path: &str,
    node_names: Option<&[String]>,
) -> rusqlite::Result<Vec<Value>> {
    let conn = open_connection(db_path, true)?;
    match node_names {
        Some(names) if !names.is_empty() => {
            let query = format!(
                "SELECT {} FROM alerts
                 WHERE node_name IN ({}) AND acknowledged = 0 AND resolved = 0
                 ORDER BY timestamp DESC",
                ALERT_COLUMNS,
                in_placeholders(names.len())
            );
            let sql_params: Vec<SqlValue> =
                names.iter().map(|n| SqlValue::Text(n.clone())).collect();
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt
                .query_map(params_from_iter(sql_params.iter()), |row| {
                    alert_row_to_json(row)
                })?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        }
        _ => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM alerts WHERE acknowledged = 0 AND resolved = 0
                 ORDER BY timestamp DESC",
                ALERT_COLUMNS
            ))?;
            let rows = stmt
                .query_map([], |row| alert_row_to_json(row))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        }
    }
}

/// Mark an alert acknowledged, stamping `acknowledged_at`.
pub fn acknowledge_alert(db_path: &str, alert_id: i64) -> rusqlite::Result<bool> {
    let conn = open_connection(db_path, false)?;
    let changed = conn.execute(
        "UPDATE alerts SET acknowledged = 1, acknowledged_at = ?1 WHERE id = ?2",
        params![iso_micros(&Utc::now()), alert_id],
    )?;
    Ok(changed > 0)
}

/// Mark an alert resolved, stamping `resolved_at`.
pub fn resolve_alert(db_path: &str, alert_id: i64) -> rusqlite::Result<bool> {
    let conn = open_connection(db_path, false)?;
    let changed = conn.execute(
        "UPDATE alerts SET resolved = 1, resolved_at = ?1 WHERE id = ?2",
        params![iso_micros(&Utc::now()), alert_id],
    )?;
    Ok(changed > 0)
}

/// Alert history for a node over the last `hours`.
pub fn get_alert_history(
    db_path: &str,
    node_name: &str,
    hours: i64,
    include_resolved: bool,
) -> rusqlite::Result<Vec<Value>> {
    let cutoff = iso_micros(&(Utc::now() - Duration::hours(hours)));
    let conn = open_connection(db_path, true)?;
    let query = if include_resolved {
        format!(
            "SELECT {} FROM alerts WHERE node_name = ?1 AND timestamp >= ?2
             ORDER BY timestamp DESC",
            ALERT_COLUMNS
        )
    } else {
        format!(
            "SELECT {} FROM alerts WHERE node_name = ?1 AND timestamp >= ?2 AND resolved = 0
             ORDER BY timestamp DESC",
            ALERT_COLUMNS
        )
    };
    let mut stmt = conn.prepare(&query)?;
    let rows = stmt
        .query_map(params![node_name, cutoff], |row| alert_row_to_json(row))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Persist an insight row.
pub fn write_insight(db_path: &str, insight: &InsightRecord) -> rusqlite::Result<()> {
    let conn = open_connection(db_path, false)?;
    conn.execute(
        "INSERT INTO insights (timestamp, node_name, insight_type, severity, title,
                               description, category, confidence, metadata)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            iso_micros(&insight.timestamp),
            insight.node_name,
            insight.insight_type,
            insight.severity.as_str(),
            insight.title,
            insight.description,
            insight.category,
            insight.confidence,
            insight.metadata.to_string(),
        ],
    )?;
    Ok(())
}

/// Recent insights, newest first, optionally filtered by node.
pub fn get_insights(
    db_path: &str,
    node_names: Option<&[String]>,
    hours: i64,
) -> rusqlite::Result<Vec<Value>> {
    let cutoff = iso_micros(&(Utc::now() - Duration::hours(hours)));
    let conn = open_connection(db_path, true)?;

    let row_to_json = |row: &rusqlite::Row| -> rusqlite::Result<Value> {
        let metadata: Option<String> = row.get(10)?;
        let metadata = metadata
            .and_then(|m| serde_json::from_str(&m).ok())
            .unwrap_or(Value::Null);
        Ok(json!({
            "id": row.get::<_, i64>(0)?,
            "timestamp": row.get::<_, String>(1)?,
            "node_name": row.get::<_, String>(2)?,
            "insight_type": row.get::<_, String>(3)?,
            "severity": row.get::<_, String>(4)?,
            "title": row.get::<_, String>(5)?,
            "description": row.get::<_, String>(6)?,
            "category": row.get::<_, Option<String>>(7)?,
            "confidence": row.get::<_, Option<f64>>(8)?,
            "acknowledged": row.get::<_, Option<i64>>(9)?.unwrap_or(0) != 0,
            "metadata": metadata,
        }))
    };
    const INSIGHT_COLUMNS: &str = "id, timestamp, node_name, insight_type, severity, title, \
         description, category, confidence, acknowledged, metadata";

    match node_names {
        Some(names) if !names.is_empty() => {
            let query = format!(
                "SELECT {} FROM insights WHERE node_name IN ({}) AND timestamp >= ?{}
                 ORDER BY timestamp DESC",
                INSIGHT_COLUMNS,
                in_placeholders(names.len()),
                names.len() + 1
            );
            let mut sql_params: Vec<SqlValue> =
                names.iter().map(|n| SqlValue::Text(n.clone())).collect();
            sql_params.push(SqlValue::Text(cutoff));
            let mut stmt = conn.prepare(&query)?;
            let rows = stmt
                .query_map(params_from_iter(sql_params.iter()), |row| row_to_json(row))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        }
        _ => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM insights WHERE timestamp >= ?1 ORDER BY timestamp DESC",
                INSIGHT_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![cutoff], |row| row_to_json(row))?
                .filter_map(|r| r.ok())
                .collect();
            Ok(rows)
        }
    }
}

/// Upsert a metric baseline under its (node, metric, window) key.
pub fn update_baseline(
    db_path: &str,
    node_name: &str,
    metric_name: &str,
    window_hours: i64,
    stats: &BaselineStats,
) -> rusqlite::Result<()> {
    let conn = open_connection(db_path, false)?;
    conn.execute(
        "INSERT OR REPLACE INTO analytics_baselines
         (node_name, metric_name, window_hours, mean_value, std_dev, min_value,
          max_value, sample_count, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            node_name,
            metric_name,
            window_hours,
            stats.mean,
            stats.std_dev,
            stats.min,
            stats.max,
            stats.count,
            iso_micros(&Utc::now()),
        ],
    )?;
    Ok(())
}

/// Read a baseline, if one has been computed.
pub fn get_baseline(
    db_path: &str,
    node_name: &str,
    metric_name: &str,
    window_hours: i64,
) -> rusqlite::Result<Option<BaselineStats>> {
    let conn = open_connection(db_path, true)?;
    let result = conn.query_row(
        "SELECT mean_value, std_dev, min_value, max_value, sample_count
         FROM analytics_baselines
         WHERE node_name = ?1 AND metric_name = ?2 AND window_hours = ?3",
        params![node_name, metric_name, window_hours],
        |row| {
            Ok(BaselineStats {
                mean: row.get::<_, Option<f64>>(0)?.unwrap_or(0.0),
                std_dev: row.get::<_, Option<f64>>(1)?.unwrap_or(0.0),
                min: row.get::<_, Option<f64>>(2)?.unwrap_or(0.0),
                max: row.get::<_, Option<f64>>(3)?.unwrap_or(0.0),
                count: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
            })
        },
    );
    match result {
        Ok(b) => Ok(Some(b)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Upsert an earnings estimate. At most one row exists per
/// (node, satellite, period); the newest write is authoritative.
pub fn write_earnings_estimate(db_path: &str, est: &EarningsEstimate) -> rusqlite::Result<()> {
    let conn = open_connection(db_path, false)?;
    conn.execute(
        "INSERT INTO earnings_estimates
         (timestamp, node_name, satellite, period, egress_bytes, egress_earnings_gross,
          egress_earnings_net, storage_bytes_hour, storage_earnings_gross, storage_earnings_net,
          repair_bytes, repair_earnings_gross, repair_earnings_net, audit_bytes,
          audit_earnings_gross, audit_earnings_net, total_earnings_gross, total_earnings_net,
          held_amount, node_age_months, held_percentage, is_finalized)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19, ?20, ?21, ?22)
         ON CONFLICT(node_name, satellite, period) DO UPDATE SET
             timestamp=excluded.timestamp,
             egress_bytes=excluded.egress_bytes,
             egress_earnings_gross=excluded.egress_earnings_gross,
             egress_earnings_net=excluded.egress_earnings_net,
             storage_bytes_hour=excluded.storage_bytes_hour,
             storage_earnings_gross=excluded.storage_earnings_gross,
             storage_earnings_net=excluded.storage_earnings_net,
             repair_bytes=excluded.repair_bytes,
             repair_earnings_gross=excluded.repair_earnings_gross,
             repair_earnings_net=excluded.repair_earnings_net,
             audit_bytes=excluded.audit_bytes,
             audit_earnings_gross=excluded.audit_earnings_gross,
             audit_earnings_net=excluded.audit_earnings_net,
             total_earnings_gross=excluded.total_earnings_gross,
             total_earnings_net=excluded.total_earnings_net,
             held_amount=excluded.held_amount,
             node_age_months=excluded.node_age_months,
             held_percentage=excluded.held_percentage,
             is_finalized=excluded.is_finalized",
        params![
            iso_micros(&est.timestamp),
            est.node_name,
            est.satellite,
            est.period,
            est.egress_bytes,
            est.egress_earnings_gross,
            est.egress_earnings_net,
            est.storage_bytes_hour,
            est.storage_earnings_gross,
            est.storage_earnings_net,
            est.repair_bytes,
            est.repair_earnings_gross,
            est.repair_earnings_net,
            est.audit_bytes,
            est.audit_earnings_gross,
            est.audit_earnings_net,
            est.total_earnings_gross,
            est.total_earnings_net,
            est.held_amount,
            est.node_age_months,
            est.held_percentage,
            est.is_finalized as i64,
        ],
    )?;
    Ok(())
}

fn earnings_row_to_json(row: &rusqlite::Row) -> rusqlite::Result<Value> {
    Ok(json!({
        "timestamp": row.get::<_, String>(0)?,
        "node_name": row.get::<_, String>(1)?,
        "satellite": row.get::<_, String>(2)?,
        "period": row.get::<_, String>(3)?,
        "egress_bytes": row.get::<_, Option<i64>>(4)?.unwrap_or(0),
        "egress_earnings_gross": row.get::<_, Option<f64>>(5)?.unwrap_or(0.0),
        "egress_earnings_net": row.get::<_, Option<f64>>(6)?.unwrap_or(0.0),
        "storage_bytes_hour": row.get::<_, Option<i64>>(7)?.unwrap_or(0),
        "storage_earnings_gross": row.get::<_, Option<f64>>(8)?.unwrap_or(0.0),
        "storage_earnings_net": row.get::<_, Option<f64>>(9)?.unwrap_or(0.0),
        "repair_bytes": row.get::<_, Option<i64>>(10)?.unwrap_or(0),
        "repair_earnings_gross": row.get::<_, Option<f64>>(11)?.unwrap_or(0.0),
        "repair_earnings_net": row.get::<_, Option<f64>>(12)?.unwrap_or(0.0),
        "audit_bytes": row.get::<_, Option<i64>>(13)?.unwrap_or(0),
        "audit_earnings_gross": row.get::<_, Option<f64>>(14)?.unwrap_or(0.0),
        "audit_earnings_net": row.get::<_, Option<f64>>(15)?.unwrap_or(0.0),
        "total_earnings_gross": row.get::<_, Option<f64>>(16)?.unwrap_or(0.0),
        "total_earnings_net": row.get::<_, Option<f64>>(17)?.unwrap_or(0.0),
        "held_amount": row.get::<_, Option<f64>>(18)?.unwrap_or(0.0),
        "node_age_months": row.get::<_, Option<i64>>(19)?,
        "held_percentage": row.get::<_, Option<f64>>(20)?,
        "is_finalized": row.get::<_, Option<i64>>(21)?.unwrap_or(0) != 0,
    }))
}

const EARNINGS_COLUMNS: &str = "timestamp, node_name, satellite, period, egress_bytes, \
     egress_earnings_gross, egress_earnings_net, storage_bytes_hour, storage_earnings_gross, \
     storage_earnings_net, repair_bytes, repair_earnings_gross, repair_earnings_net, \
     audit_bytes, audit_earnings_gross, audit_earnings_net, total_earnings_gross, \
     total_earnings_net, held_amount, node_age_months, held_percentage, is_finalized";

/// Earnings estimates for a set of nodes, optionally pinned to a period,
/// bounded by `days` of write recency. Newest first.
pub fn get_earnings_estimates(
    db_path: &str,
    node_names: &[String],
    period: Option<&str>,
    days: i64,
) -> rusqlite::Result<Vec<Value>> {
    if node_names.is_empty() {
        return Ok(vec![]);
    }
    let cutoff = iso_micros(&(Utc::now() - Duration::days(days)));
    let conn = open_connection(db_path, true)?;

    let mut sql_params: Vec<SqlValue> = node_names
        .iter()
        .map(|n| SqlValue::Text(n.clone()))
        .collect();
    let mut query = format!(
        "SELECT {} FROM earnings_estimates WHERE node_name IN ({})",
        EARNINGS_COLUMNS,
        in_placeholders(node_names.len())
    );
    if let Some(p) = period {
        sql_params.push(SqlValue::Text(p.to_string()));
        query.push_str(&format!(" AND period = ?{}", sql_params.len()));
    }
    sql_params.push(SqlValue::Text(cutoff));
    query.push_str(&format!(
        " AND timestamp >= ?{} ORDER BY timestamp DESC",
        sql_params.len()
    ));

    let mut stmt = conn.prepare(&query)?;
    let rows = stmt
        .query_map(params_from_iter(sql_params.iter()), |row| {
            earnings_row_to_json(row)
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Earnings rows for one node (optionally one satellite) over the last
/// `days` of periods, newest period first.
pub fn get_earnings_history(
    db_path: &str,
    node_name: &str,
    satellite: Option<&str>,
    days: i64,
) -> rusqlite::Result<Vec<Value>> {
    let cutoff = iso_micros(&(Utc::now() - Duration::days(days)));
    let conn = open_connection(db_path, true)?;
    let mut rows = Vec::new();
    match satellite {
        Some(sat) => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM earnings_estimates
                 WHERE node_name = ?1 AND satellite = ?2 AND timestamp >= ?3
                 ORDER BY period DESC, satellite",
                EARNINGS_COLUMNS
            ))?;
            let mapped = stmt.query_map(params![node_name, sat, cutoff], |row| {
                earnings_row_to_json(row)
            })?;
            for r in mapped.flatten() {
                rows.push(r);
            }
        }
        None => {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM earnings_estimates
                 WHERE node_name = ?1 AND timestamp >= ?2
                 ORDER BY period DESC, satellite",
                EARNINGS_COLUMNS
            ))?;
            let mapped = stmt.query_map(params![node_name, cutoff], |row| {
                earnings_row_to_json(row)
            })?;
            for r in mapped.flatten() {
                rows.push(r);
            }
        }
    }
    Ok(rows)
}

/// Successful traffic byte sums for one (node, satellite) in a period:
/// (egress, repair, audit).
pub fn traffic_byte_sums(
    db_path: &str,
    node_name: &str,
    satellite: &str,
    period_start_iso: &str,
    period_end_iso: &str,
) -> rusqlite::Result<(i64, i64, i64)> {
    let conn = open_connection(db_path, true)?;
    conn.query_row(
        "SELECT
             SUM(CASE WHEN action LIKE '%GET%' AND action != 'GET_AUDIT' AND action != 'GET_REPAIR'
                      AND status = 'success' THEN size ELSE 0 END) as egress_bytes,
             SUM(CASE WHEN action = 'GET_REPAIR' AND status = 'success' THEN size ELSE 0 END) as repair_bytes,
             SUM(CASE WHEN action = 'GET_AUDIT' AND status = 'success' THEN size ELSE 0 END) as audit_bytes
         FROM events
         WHERE node_name = ?1 AND satellite_id = ?2 AND timestamp >= ?3 AND timestamp < ?4",
        params![node_name, satellite, period_start_iso, period_end_iso],
        |row| {
            Ok((
                row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                row.get::<_, Option<i64>>(2)?.unwrap_or(0),
            ))
        },
    )
}

/// (timestamp, used_bytes) samples for GB-hour integration, oldest first.
pub fn storage_samples_for_period(
    db_path: &str,
    node_name: &str,
    period_start_iso: &str,
    period_end_iso: &str,
) -> rusqlite::Result<Vec<(DateTime<Utc>, i64)>> {
    let conn = open_connection(db_path, true)?;
    let mut stmt = conn.prepare(
        "SELECT timestamp, used_bytes FROM storage_snapshots
         WHERE node_name = ?1 AND timestamp >= ?2 AND timestamp < ?3
           AND used_bytes IS NOT NULL
         ORDER BY timestamp ASC",
    )?;
    let rows = stmt
        .query_map(params![node_name, period_start_iso, period_end_iso], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .filter_map(|r| r.ok())
        .filter_map(|(ts, used)| {
            DateTime::parse_from_rfc3339(&ts)
                .ok()
                .map(|dt| (dt.with_timezone(&Utc), used))
        })
        .collect();
    Ok(rows)
}

/// Satellites a node has exchanged traffic with
pub fn distinct_satellites(db_path: &str, node_name: &str) -> rusqlite::Result<Vec<String>> {
    let conn = open_connection(db_path, true)?;
    let mut stmt = conn.prepare(
        "SELECT DISTINCT satellite_id FROM events
         WHERE node_name = ?1 AND satellite_id != ''",
    )?;
    let rows = stmt
        .query_map(params![node_name], |row| row.get::<_, String>(0))?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

/// Earliest persisted timestamp for a node across events and storage
/// snapshots; used to estimate node age.
pub fn earliest_node_activity(
    db_path: &str,
    node_name: &str,
) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let conn = open_connection(db_path, true)?;
    let earliest_event: Option<String> = conn.query_row(
        "SELECT MIN(timestamp) FROM events WHERE node_name = ?1",
        params![node_name],
        |row| row.get(0),
    )?;
    let earliest_storage: Option<String> = conn.query_row(
        "SELECT MIN(timestamp) FROM storage_snapshots WHERE node_name = ?1",
        params![node_name],
        |row| row.get(0),
    )?;
    let earliest = match (earliest_event, earliest_storage) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, Some(b)) => Some(b),
        (None, None) => None,
    };
    Ok(earliest
        .and_then(|ts| DateTime::parse_from_rfc3339(&ts).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}

/// Re-hydrate a node's live window from persisted rows, oldest first.
pub fn load_initial_events(
    db_path: &str,
    node_name: &str,
    window_minutes: i64,
) -> rusqlite::Result<Vec<TrafficEvent>> {
    let cutoff = iso_micros(&(Utc::now() - Duration::minutes(window_minutes)));
    let conn = open_connection(db_path, true)?;
    let mut stmt = conn.prepare(
        "SELECT timestamp, action, status, size, piece_id, satellite_id, remote_ip,
                country, latitude, longitude, error_reason, node_name, duration_ms
         FROM events WHERE node_name = ?1 AND timestamp >= ?2 ORDER BY timestamp ASC",
    )?;
    let rows = stmt
        .query_map(params![node_name, cutoff], |row| {
            let ts: String = row.get(0)?;
            let action: String = row.get(1)?;
            let status: String = row.get(2)?;
            Ok((
                ts,
                action,
                status,
                row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<f64>>(8)?,
                row.get::<_, Option<f64>>(9)?,
                row.get::<_, Option<String>>(10)?,
                row.get::<_, Option<String>>(11)?.unwrap_or_default(),
                row.get::<_, Option<i64>>(12)?,
            ))
        })?
        .filter_map(|r| r.ok())
        .filter_map(
            |(ts, action, status, size, piece, sat, ip, country, lat, lon, err, node, dur)| {
                let timestamp = DateTime::parse_from_rfc3339(&ts).ok()?.with_timezone(&Utc);
                Some(TrafficEvent {
                    ts_unix: timestamp.timestamp_micros() as f64 / 1e6,
                    timestamp,
                    category: categorize_action(&action),
                    action,
                    status: EventStatus::from_db(&status),
                    size,
                    piece_id: piece,
                    satellite_id: sat,
                    remote_ip: ip,
                    location: Location {
                        country,
                        lat,
                        lon,
                    },
                    error_reason: err,
                    node_name: node,
                    duration_ms: dur,
                })
            },
        )
        .collect();
    Ok(rows)
}

/// Read a key from the app persistent state table.
pub fn get_persistent_state(db_path: &str, key: &str) -> rusqlite::Result<Option<String>> {
    let conn = open_connection(db_path, true)?;
    let result = conn.query_row(
        "SELECT value FROM app_persistent_state WHERE key = ?1",
        params![key],
        |row| row.get::<_, String>(0),
    );
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Write a key to the app persistent state table.
pub fn set_persistent_state(db_path: &str, key: &str, value: &str) -> rusqlite::Result<()> {
    let conn = open_connection(db_path, false)?;
    conn.execute(
        "INSERT OR REPLACE INTO app_persistent_state (key, value) VALUES (?1, ?2)",
        params![key, value],
    )?;
    Ok(())
}
