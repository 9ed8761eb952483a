use chrono::{Duration, Utc};
use serde_json::json;
use tempfile::TempDir;

use crate::db::*;
use crate::db_utils::open_connection;
use crate::types::*;

fn temp_db() -> (String, TempDir) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("test.db").to_str().unwrap().to_string();
    init_db(&path).unwrap();
    (path, dir)
}

fn sample_event(node: &str, age_minutes: i64, action: &str, status: EventStatus) -> TrafficEvent {
    let ts = Utc::now() - Duration::minutes(age_minutes);
    TrafficEvent {
        timestamp: ts,
        ts_unix: ts.timestamp_micros() as f64 / 1e6,
        action: action.to_string(),
        status,
        size: 1024000,
        piece_id: Some("piece-1".to_string()),
        satellite_id: "sat-1".to_string(),
        remote_ip: Some("192.168.1.1".to_string()),
        location: Location {
            country: Some("US".to_string()),
            lat: Some(37.77),
            lon: Some(-122.42),
        },
        error_reason: None,
        node_name: node.to_string(),
        duration_ms: Some(150),
        category: crate::parser::categorize_action(action),
    }
}

fn sample_estimate(node: &str, satellite: &str, period: &str, net: f64) -> EarningsEstimate {
    EarningsEstimate {
        timestamp: Utc::now(),
        node_name: node.to_string(),
        satellite: satellite.to_string(),
        period: period.to_string(),
        egress_bytes: 1_000_000_000,
        egress_earnings_gross: 2.0,
        egress_earnings_net: 2.0,
        storage_bytes_hour: 100_000_000_000,
        storage_earnings_gross: 1.5,
        storage_earnings_net: 1.5,
        repair_bytes: 0,
        repair_earnings_gross: 0.0,
        repair_earnings_net: 0.0,
        audit_bytes: 0,
        audit_earnings_gross: 0.0,
        audit_earnings_net: 0.0,
        total_earnings_gross: net,
        total_earnings_net: net,
        held_amount: 0.0,
        node_age_months: 16,
        held_percentage: 0.0,
        is_finalized: false,
    }
}

#[test]
fn test_init_creates_all_tables() {
    let (path, _dir) = temp_db();
    let conn = open_connection(&path, true).unwrap();
    for table in [
        "events",
        "hourly_stats",
        "hashstore_compaction_history",
        "reputation_history",
        "storage_snapshots",
        "alerts",
        "insights",
        "analytics_baselines",
        "earnings_estimates",
        "app_persistent_state",
    ] {
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1",
                rusqlite::params![table],
                |_| Ok(true),
            )
            .unwrap_or(false);
        assert!(exists, "missing table {}", table);
    }
}

#[test]
fn test_init_is_idempotent() {
    let (path, _dir) = temp_db();
    init_db(&path).unwrap();
    init_db(&path).unwrap();
}

#[test]
fn test_batch_write_commits_all_rows() {
    let (path, _dir) = temp_db();
    let events: Vec<TrafficEvent> = (0..25)
        .map(|i| sample_event("node-a", i % 5, "GET", EventStatus::Success))
        .collect();
    let written = write_event_batch(&path, &events).unwrap();
    assert_eq!(written, 25);

    let conn = open_connection(&path, true).unwrap();
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 25);
}

#[test]
fn test_migrates_legacy_events_table() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("legacy.db").to_str().unwrap().to_string();
    {
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE events (id INTEGER PRIMARY KEY, timestamp DATETIME, action TEXT,
                 status TEXT, size INTEGER, piece_id TEXT, satellite_id TEXT, remote_ip TEXT,
                 country TEXT, latitude REAL, longitude REAL, error_reason TEXT);
             INSERT INTO events VALUES (NULL, '2025-01-01T00:00:00.000000Z', 'GET', 'success',
                 10, 'p', 's', '1.2.3.4', 'US', 0.0, 0.0, NULL);
             CREATE TABLE hourly_stats (hour_timestamp TEXT PRIMARY KEY, dl_success INTEGER DEFAULT 0,
                 dl_fail INTEGER DEFAULT 0, ul_success INTEGER DEFAULT 0, ul_fail INTEGER DEFAULT 0,
                 audit_success INTEGER DEFAULT 0, audit_fail INTEGER DEFAULT 0);
             INSERT INTO hourly_stats VALUES ('2025-01-01T00:00:00.000Z', 3, 1, 2, 0, 1, 0);",
        )
        .unwrap();
    }
    init_db(&path).unwrap();

    let conn = open_connection(&path, true).unwrap();
    // Legacy rows survive and gain the node_name default
    let node: String = conn
        .query_row("SELECT node_name FROM events LIMIT 1", [], |row| row.get(0))
        .unwrap();
    assert_eq!(node, "default");
    let dur: Option<i64> = conn
        .query_row("SELECT duration_ms FROM events LIMIT 1", [], |row| row.get(0))
        .unwrap();
    assert_eq!(dur, None);
    // hourly_stats rebuilt with composite key, rows preserved
    let (node, dl): (String, i64) = conn
        .query_row(
            "SELECT node_name, dl_success FROM hourly_stats LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .unwrap();
    assert_eq!(node, "default");
    assert_eq!(dl, 3);
}

#[test]
fn test_prune_respects_retention() {
    let (path, _dir) = temp_db();
    let old = sample_event("node-a", 60 * 24 * 5, "GET", EventStatus::Success);
    let fresh = sample_event("node-a", 1, "GET", EventStatus::Success);
    write_event_batch(&path, &[old, fresh]).unwrap();

    let policy = RetentionPolicy {
        events_days: 2,
        hashstore_days: 180,
        alerts_days: 90,
        insights_days: 90,
        baselines_days: 180,
        earnings_days: 365,
    };
    let deleted = prune(&path, &policy).unwrap();
    assert_eq!(deleted, 1);

    let cutoff = iso_micros(&(Utc::now() - Duration::days(2)));
    let conn = open_connection(&path, true).unwrap();
    let stale: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM events WHERE timestamp < ?1",
            rusqlite::params![cutoff],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(stale, 0);
}

#[test]
fn test_hourly_backfill_is_idempotent() {
    let (path, _dir) = temp_db();
    let events = vec![
        sample_event("node-a", 10, "GET", EventStatus::Success),
        sample_event("node-a", 12, "GET", EventStatus::Failed),
        sample_event("node-a", 14, "PUT", EventStatus::Success),
        sample_event("node-a", 16, "GET_AUDIT", EventStatus::Success),
        sample_event("node-b", 20, "GET_REPAIR", EventStatus::Success),
    ];
    write_event_batch(&path, &events).unwrap();

    backfill_hourly_stats(&path).unwrap();
    let conn = open_connection(&path, true).unwrap();
    let first: Vec<(String, String, i64, i64, i64)> = conn
        .prepare("SELECT hour_timestamp, node_name, dl_success, ul_success, audit_success FROM hourly_stats ORDER BY node_name, hour_timestamp")
        .unwrap()
        .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    drop(conn);

    backfill_hourly_stats(&path).unwrap();
    let conn = open_connection(&path, true).unwrap();
    let second: Vec<(String, String, i64, i64, i64)> = conn
        .prepare("SELECT hour_timestamp, node_name, dl_success, ul_success, audit_success FROM hourly_stats ORDER BY node_name, hour_timestamp")
        .unwrap()
        .query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
        })
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(first, second);
    // GET_REPAIR counts as a download for node-b
    let b_row = second.iter().find(|r| r.1 == "node-b").unwrap();
    assert_eq!(b_row.2, 1);
}

#[test]
fn test_earnings_upsert_keeps_one_row_per_key() {
    let (path, _dir) = temp_db();
    write_earnings_estimate(&path, &sample_estimate("n", "sat", "2025-01", 1.0)).unwrap();
    write_earnings_estimate(&path, &sample_estimate("n", "sat", "2025-01", 2.5)).unwrap();
    write_earnings_estimate(&path, &sample_estimate("n", "sat", "2025-02", 9.9)).unwrap();

    let rows = get_earnings_estimates(&path, &["n".to_string()], Some("2025-01"), 30).unwrap();
    assert_eq!(rows.len(), 1);
    assert!((rows[0]["total_earnings_net"].as_f64().unwrap() - 2.5).abs() < 1e-9);

    let all = get_earnings_estimates(&path, &["n".to_string()], None, 30).unwrap();
    assert_eq!(all.len(), 2);
}

#[test]
fn test_alert_lifecycle() {
    let (path, _dir) = temp_db();
    let alert = AlertRecord {
        timestamp: Utc::now(),
        node_name: "n".to_string(),
        alert_type: "storage_warning".to_string(),
        severity: Severity::Warning,
        title: "Storage Warning: 85.0% Full".to_string(),
        message: "Storage is approaching capacity.".to_string(),
        metadata: json!({"used_percent": 85.0}),
    };
    let id = write_alert(&path, &alert).unwrap();
    assert!(id > 0);

    let active = get_active_alerts(&path, Some(&["n".to_string()])).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0]["metadata"]["used_percent"], 85.0);

    assert!(acknowledge_alert(&path, id).unwrap());
    let active = get_active_alerts(&path, None).unwrap();
    assert!(active.is_empty());

    // Acknowledged alerts still show in history with their timestamps set
    let history = get_alert_history(&path, "n", 24, true).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["acknowledged"], true);
    assert!(history[0]["acknowledged_at"].is_string());
    assert_eq!(history[0]["resolved"], false);

    assert!(resolve_alert(&path, id).unwrap());
    let history = get_alert_history(&path, "n", 24, true).unwrap();
    assert_eq!(history[0]["resolved"], true);
}

#[test]
fn test_reputation_latest_per_satellite() {
    let (path, _dir) = temp_db();
    let older = ReputationSample {
        timestamp: Utc::now() - Duration::hours(2),
        node_name: "n".to_string(),
        satellite: "sat-1".to_string(),
        audit_score: Some(90.0),
        suspension_score: Some(100.0),
        online_score: Some(99.0),
        audit_success_count: 50,
        audit_total_count: 52,
        is_disqualified: false,
        is_suspended: false,
    };
    let mut newer = older.clone();
    newer.timestamp = Utc::now();
    newer.audit_score = Some(95.0);
    write_reputation_history(&path, &[older, newer]).unwrap();

    let latest = get_latest_reputation(&path, &["n".to_string()]).unwrap();
    assert_eq!(latest.len(), 1);
    assert!((latest[0]["audit_score"].as_f64().unwrap() - 95.0).abs() < 1e-9);
}

#[test]
fn test_storage_snapshot_partial_rows() {
    let (path, _dir) = temp_db();
    let partial = StorageSnapshot {
        timestamp: Utc::now(),
        node_name: "n".to_string(),
        total_bytes: None,
        used_bytes: None,
        available_bytes: Some(5_000_000_000),
        trash_bytes: None,
        used_percent: None,
        trash_percent: None,
        available_percent: None,
    };
    write_storage_snapshot(&path, &partial).unwrap();
    let latest = get_latest_storage(&path, &["n".to_string()]).unwrap();
    assert_eq!(latest.len(), 1);
    assert!(latest[0]["used_bytes"].is_null());
    assert_eq!(latest[0]["available_bytes"], 5_000_000_000i64);
}

#[test]
fn test_baseline_upsert_and_read_back() {
    let (path, _dir) = temp_db();
    let stats = BaselineStats {
        mean: 100.0,
        std_dev: 10.0,
        min: 80.0,
        max: 120.0,
        count: 100,
    };
    update_baseline(&path, "n", "success_rate", 168, &stats).unwrap();
    let read = get_baseline(&path, "n", "success_rate", 168).unwrap().unwrap();
    assert_eq!(read, stats);

    // Upsert overwrites the same (node, metric, window) key
    let stats2 = BaselineStats {
        mean: 50.0,
        ..stats
    };
    update_baseline(&path, "n", "success_rate", 168, &stats2).unwrap();
    let read = get_baseline(&path, "n", "success_rate", 168).unwrap().unwrap();
    assert!((read.mean - 50.0).abs() < 1e-9);

    assert!(get_baseline(&path, "n", "unknown_metric", 168).unwrap().is_none());
}

#[test]
fn test_compaction_records_and_filters() {
    let (path, _dir) = temp_db();
    let record = CompactionRecord {
        node_name: "n".to_string(),
        satellite: "sat-1".to_string(),
        store: "s0".to_string(),
        last_run_iso: iso_micros(&Utc::now()),
        duration: 12.5,
        data_reclaimed_bytes: 1_048_576,
        data_rewritten_bytes: 2048,
        table_load: 0.42,
        trash_percent: 3.5,
    };
    write_compaction_record(&path, &record).unwrap();
    // Same identity replaces rather than duplicates
    write_compaction_record(&path, &record).unwrap();

    let rows = get_hashstore_stats(&path, Some(&["n".to_string()]), None, None).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["store"], "s0");

    let none = get_hashstore_stats(&path, Some(&["other".to_string()]), None, None).unwrap();
    assert!(none.is_empty());

    let filtered = get_hashstore_stats(&path, None, Some("sat-1"), Some("s0")).unwrap();
    assert_eq!(filtered.len(), 1);
}

#[test]
fn test_load_initial_events_window() {
    let (path, _dir) = temp_db();
    let in_window = sample_event("n", 10, "GET", EventStatus::Success);
    let out_of_window = sample_event("n", 120, "GET", EventStatus::Success);
    write_event_batch(&path, &[in_window, out_of_window]).unwrap();

    let events = load_initial_events(&path, "n", 60).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].category, TrafficCategory::Get);
    assert_eq!(events[0].status, EventStatus::Success);
}

#[test]
fn test_traffic_byte_sums_split_by_class() {
    let (path, _dir) = temp_db();
    let mut egress = sample_event("n", 10, "GET", EventStatus::Success);
    egress.size = 1000;
    let mut repair = sample_event("n", 10, "GET_REPAIR", EventStatus::Success);
    repair.size = 300;
    let mut audit = sample_event("n", 10, "GET_AUDIT", EventStatus::Success);
    audit.size = 7;
    let mut failed = sample_event("n", 10, "GET", EventStatus::Failed);
    failed.size = 9999;
    write_event_batch(&path, &[egress, repair, audit, failed]).unwrap();

    let start = iso_micros(&(Utc::now() - Duration::hours(1)));
    let end = iso_micros(&(Utc::now() + Duration::hours(1)));
    let (e, r, a) = traffic_byte_sums(&path, "n", "sat-1", &start, &end).unwrap();
    assert_eq!((e, r, a), (1000, 300, 7));
}

#[test]
fn test_persistent_state_round_trip() {
    let (path, _dir) = temp_db();
    assert!(get_persistent_state(&path, "last_prune_iso").unwrap().is_none());
    set_persistent_state(&path, "last_prune_iso", "2025-01-01T00:00:00.000000Z").unwrap();
    assert_eq!(
        get_persistent_state(&path, "last_prune_iso").unwrap().unwrap(),
        "2025-01-01T00:00:00.000000Z"
    );
}
