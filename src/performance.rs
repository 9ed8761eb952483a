/// Performance Analysis
///
/// Throughput/concurrency time bins (live tick, in-memory history, and
/// SQL-aggregated history with zero-fill), latency percentiles per
/// operation class, slow-operation detection and latency histograms.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use rusqlite::{params_from_iter, types::Value as SqlValue};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::db_utils::open_connection;
use crate::parser::categorize_action;
use crate::types::{iso_micros, EventStatus, TrafficCategory, TrafficEvent};

/// Operations slower than this are reported individually (ms)
const SLOW_OP_THRESHOLD_MS: i64 = 5000;
const SLOW_OP_LIMIT: usize = 10;
/// Cap on events pulled for a latency analysis
const LATENCY_QUERY_LIMIT: i64 = 10000;

#[derive(Default, Clone, Copy)]
struct Bin {
    ingress_bytes: i64,
    egress_bytes: i64,
    ingress_pieces: i64,
    egress_pieces: i64,
    total_ops: i64,
}

fn bin_to_json(bucket_start_unix: i64, bin: &Bin, interval_sec: i64) -> Value {
    let ts = Utc
        .timestamp_opt(bucket_start_unix, 0)
        .single()
        .unwrap_or_else(Utc::now);
    let interval = interval_sec.max(1) as f64;
    json!({
        "timestamp": iso_micros(&ts),
        "ingress_mbps": round2((bin.ingress_bytes as f64 * 8.0) / (interval * 1e6)),
        "egress_mbps": round2((bin.egress_bytes as f64 * 8.0) / (interval * 1e6)),
        "ingress_bytes": bin.ingress_bytes,
        "egress_bytes": bin.egress_bytes,
        "ingress_pieces": bin.ingress_pieces,
        "egress_pieces": bin.egress_pieces,
        "concurrency": round2(bin.total_ops as f64 / interval),
        "total_ops": bin.total_ops,
        "bin_duration_seconds": interval_sec,
    })
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

fn accumulate(bin: &mut Bin, event: &TrafficEvent) {
    bin.total_ops += 1;
    if event.status == EventStatus::Success {
        match event.category {
            TrafficCategory::Get => {
                bin.egress_bytes += event.size;
                bin.egress_pieces += 1;
            }
            TrafficCategory::Put => {
                bin.ingress_bytes += event.size;
                bin.ingress_pieces += 1;
            }
            _ => {}
        }
    }
}

fn zero_fill(
    sparse: BTreeMap<i64, Bin>,
    start_unix: i64,
    end_unix: i64,
    interval_sec: i64,
) -> Vec<Value> {
    let interval = interval_sec.max(1);
    let start_bucket = (start_unix / interval) * interval;
    let end_bucket = (end_unix / interval) * interval;

    let mut filled = Vec::new();
    let mut bucket = start_bucket;
    while bucket <= end_bucket {
        let bin = sparse.get(&bucket).copied().unwrap_or_default();
        filled.push(bin_to_json(bucket, &bin, interval));
        bucket += interval;
    }
    filled
}

/// Performance series from in-memory events: `points` bins of
/// `interval_sec`, zero-filled, stopping at the last *full* bin so the live
/// stream can hand over cleanly.
pub fn historical_performance(
    events: &[Arc<TrafficEvent>],
    points: usize,
    interval_sec: i64,
) -> Vec<Value> {
    let interval = interval_sec.max(1);
    let now_unix = Utc::now().timestamp();
    let cutoff_unix = now_unix - (points as i64) * interval;
    let last_full_bin = (now_unix / interval - 1) * interval;

    let mut buckets: BTreeMap<i64, Bin> = BTreeMap::new();
    for event in events {
        let ts = event.ts_unix as i64;
        if ts < cutoff_unix || ts >= last_full_bin + interval {
            continue;
        }
        let bucket = (ts / interval) * interval;
        accumulate(buckets.entry(bucket).or_default(), event);
    }

    zero_fill(buckets, cutoff_unix, last_full_bin, interval)
}

/// One live bin from the events of the current tick
pub fn live_performance_bin(events: &[Arc<TrafficEvent>], interval_sec: i64) -> Value {
    let mut bin = Bin::default();
    for event in events {
        accumulate(&mut bin, event);
    }
    let bucket = (Utc::now().timestamp() / interval_sec.max(1)) * interval_sec.max(1);
    bin_to_json(bucket, &bin, interval_sec)
}

/// Performance series from the database. Windows beyond six hours read the
/// hourly rollups; shorter windows bin raw events.
pub fn aggregated_performance(
    db_path: &str,
    node_names: &[String],
    time_window_hours: i64,
) -> rusqlite::Result<Vec<Value>> {
    if node_names.is_empty() {
        return Ok(vec![]);
    }
    let now = Utc::now();
    let start_time = now - ChronoDuration::hours(time_window_hours);
    let start_iso = iso_micros(&start_time);

    let bin_size_min: i64 = if time_window_hours <= 1 {
        2
    } else if time_window_hours <= 6 {
        10
    } else {
        30
    };
    let conn = open_connection(db_path, true)?;

    let placeholders: Vec<String> = (0..node_names.len())
        .map(|i| format!("?{}", i + 2))
        .collect();
    let placeholders = placeholders.join(",");

    let mut sql_params: Vec<SqlValue> = vec![SqlValue::Text(start_iso)];
    sql_params.extend(node_names.iter().map(|n| SqlValue::Text(n.clone())));

    let mut buckets: BTreeMap<i64, Bin> = BTreeMap::new();
    let actual_bin_sec;

    if time_window_hours > 6 {
        actual_bin_sec = 3600;
        let query = format!(
            "SELECT CAST(strftime('%s', hour_timestamp) AS INTEGER) as bucket,
                    SUM(total_upload_size) as ingress_bytes,
                    SUM(total_download_size) as egress_bytes,
                    SUM(ul_success) as ingress_pieces, SUM(dl_success) as egress_pieces,
                    SUM(dl_success + dl_fail + ul_success + ul_fail + audit_success + audit_fail) as total_ops
             FROM hourly_stats WHERE hour_timestamp >= ?1 AND node_name IN ({})
             GROUP BY bucket ORDER BY bucket ASC",
            placeholders
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(sql_params.iter()), |row| {
            Ok((
                row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                Bin {
                    ingress_bytes: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    egress_bytes: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    ingress_pieces: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    egress_pieces: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    total_ops: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                },
            ))
        })?;
        for row in rows.flatten() {
            buckets.insert(row.0, row.1);
        }
    } else {
        actual_bin_sec = bin_size_min * 60;
        let query = format!(
            "SELECT (CAST(strftime('%s', timestamp) AS INTEGER) / {bin}) * {bin} as bucket,
                    SUM(CASE WHEN action LIKE '%PUT%' AND status = 'success' THEN size ELSE 0 END) as ingress_bytes,
                    SUM(CASE WHEN action LIKE '%GET%' AND status = 'success' AND action != 'GET_AUDIT' THEN size ELSE 0 END) as egress_bytes,
                    SUM(CASE WHEN action LIKE '%PUT%' AND status = 'success' THEN 1 ELSE 0 END) as ingress_pieces,
                    SUM(CASE WHEN action LIKE '%GET%' AND status = 'success' AND action != 'GET_AUDIT' THEN 1 ELSE 0 END) as egress_pieces,
                    COUNT(*) as total_ops
             FROM events WHERE timestamp >= ?1 AND node_name IN ({ph})
             GROUP BY bucket ORDER BY bucket ASC",
            bin = actual_bin_sec,
            ph = placeholders
        );
        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(params_from_iter(sql_params.iter()), |row| {
            Ok((
                row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                Bin {
                    ingress_bytes: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                    egress_bytes: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                    ingress_pieces: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                    egress_pieces: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
                    total_ops: row.get::<_, Option<i64>>(5)?.unwrap_or(0),
                },
            ))
        })?;
        for row in rows.flatten() {
            buckets.insert(row.0, row.1);
        }
    }

    Ok(zero_fill(
        buckets,
        start_time.timestamp(),
        now.timestamp(),
        actual_bin_sec,
    ))
}

/// Nearest-rank percentiles with interpolation between adjacent ranks
pub fn calculate_percentiles(values: &[f64], percentiles: &[u32]) -> HashMap<String, f64> {
    let mut result = HashMap::new();
    if values.is_empty() {
        for p in percentiles {
            result.insert(format!("p{}", p), 0.0);
        }
        return result;
    }

    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    for p in percentiles {
        let rank = (*p as f64 / 100.0) * sorted.len() as f64;
        let value = if rank < 1.0 {
            sorted[0]
        } else if rank >= sorted.len() as f64 {
            sorted[sorted.len() - 1]
        } else {
            let lower_idx = rank as usize - 1;
            let upper_idx = (lower_idx + 1).min(sorted.len() - 1);
            let fraction = rank - rank.floor();
            sorted[lower_idx] + fraction * (sorted[upper_idx] - sorted[lower_idx])
        };
        result.insert(format!("p{}", p), value);
    }
    result
}

/// Latency statistics per operation class over events carrying durations.
/// Only successful operations count toward the percentiles.
pub fn analyze_latency_data(events: &[(TrafficCategory, EventStatus, i64)]) -> Value {
    let mut by_category: HashMap<&'static str, Vec<f64>> = HashMap::new();
    for key in ["get", "put", "audit", "all"] {
        by_category.insert(key, Vec::new());
    }

    for (category, status, duration_ms) in events {
        if *duration_ms <= 0 || *status != EventStatus::Success {
            continue;
        }
        let bucket = match category {
            TrafficCategory::Get => Some("get"),
            TrafficCategory::Put => Some("put"),
            TrafficCategory::Audit => Some("audit"),
            _ => None,
        };
        if let Some(bucket) = bucket {
            by_category.get_mut(bucket).unwrap().push(*duration_ms as f64);
        }
        by_category.get_mut("all").unwrap().push(*duration_ms as f64);
    }

    let mut results = serde_json::Map::new();
    for (category, durations) in by_category {
        let entry = if durations.is_empty() {
            json!({
                "count": 0, "mean": 0, "median": 0,
                "p50": 0, "p95": 0, "p99": 0, "min": 0, "max": 0,
            })
        } else {
            let pcts = calculate_percentiles(&durations, &[50, 95, 99]);
            let mean = durations.iter().sum::<f64>() / durations.len() as f64;
            let mut sorted = durations.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let median = if sorted.len() % 2 == 0 {
                (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
            } else {
                sorted[sorted.len() / 2]
            };
            json!({
                "count": durations.len(),
                "mean": round2(mean),
                "median": round2(median),
                "p50": round2(pcts["p50"]),
                "p95": round2(pcts["p95"]),
                "p99": round2(pcts["p99"]),
                "min": sorted[0],
                "max": sorted[sorted.len() - 1],
            })
        };
        results.insert(category.to_string(), entry);
    }
    Value::Object(results)
}

/// Latency statistics and slow operations for a node set, straight from
/// the events table.
pub fn latency_stats(
    db_path: &str,
    node_names: &[String],
    hours: i64,
) -> rusqlite::Result<Value> {
    if node_names.is_empty() {
        return Ok(json!({"statistics": {}, "slow_operations": []}));
    }
    let cutoff = iso_micros(&(Utc::now() - ChronoDuration::hours(hours)));
    let conn = open_connection(db_path, true)?;

    let placeholders: Vec<String> = (0..node_names.len())
        .map(|i| format!("?{}", i + 1))
        .collect();
    let query = format!(
        "SELECT timestamp, action, status, size, piece_id, satellite_id, duration_ms, node_name
         FROM events
         WHERE node_name IN ({}) AND timestamp >= ?{} AND duration_ms IS NOT NULL AND duration_ms > 0
         ORDER BY timestamp DESC LIMIT {}",
        placeholders.join(","),
        node_names.len() + 1,
        LATENCY_QUERY_LIMIT
    );
    let mut sql_params: Vec<SqlValue> = node_names
        .iter()
        .map(|n| SqlValue::Text(n.clone()))
        .collect();
    sql_params.push(SqlValue::Text(cutoff));

    struct LatencyRow {
        timestamp: String,
        action: String,
        status: String,
        size: i64,
        piece_id: String,
        satellite_id: String,
        duration_ms: i64,
        node_name: String,
    }

    let mut stmt = conn.prepare(&query)?;
    let rows: Vec<LatencyRow> = stmt
        .query_map(params_from_iter(sql_params.iter()), |row| {
            Ok(LatencyRow {
                timestamp: row.get(0)?,
                action: row.get(1)?,
                status: row.get(2)?,
                size: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                piece_id: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                satellite_id: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
                duration_ms: row.get(6)?,
                node_name: row.get(7)?,
            })
        })?
        .filter_map(|r| r.ok())
        .collect();

    let class_rows: Vec<(TrafficCategory, EventStatus, i64)> = rows
        .iter()
        .map(|r| {
            (
                categorize_action(&r.action),
                EventStatus::from_db(&r.status),
                r.duration_ms,
            )
        })
        .collect();
    let statistics = analyze_latency_data(&class_rows);

    let mut slow: Vec<&LatencyRow> = rows
        .iter()
        .filter(|r| r.duration_ms >= SLOW_OP_THRESHOLD_MS)
        .collect();
    slow.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
    let slow_operations: Vec<Value> = slow
        .into_iter()
        .take(SLOW_OP_LIMIT)
        .map(|r| {
            json!({
                "timestamp": r.timestamp,
                "action": r.action,
                "duration_ms": r.duration_ms,
                "piece_id": r.piece_id,
                "satellite_id": r.satellite_id,
                "status": r.status,
                "size": r.size,
                "node_name": r.node_name,
            })
        })
        .collect();

    Ok(json!({
        "statistics": statistics,
        "slow_operations": slow_operations,
        "total_operations": rows.len(),
        "operations_with_latency": rows.len(),
    }))
}

/// Bucketed latency distribution for successful operations
pub fn latency_histogram(
    db_path: &str,
    node_names: &[String],
    hours: i64,
    bucket_size_ms: i64,
) -> rusqlite::Result<Vec<Value>> {
    if node_names.is_empty() {
        return Ok(vec![]);
    }
    let bucket_size = bucket_size_ms.max(1);
    let cutoff = iso_micros(&(Utc::now() - ChronoDuration::hours(hours)));
    let conn = open_connection(db_path, true)?;

    let placeholders: Vec<String> = (0..node_names.len())
        .map(|i| format!("?{}", i + 1))
        .collect();
    let query = format!(
        "SELECT (duration_ms / {bucket}) * {bucket} as bucket_start, COUNT(*) as count
         FROM events
         WHERE node_name IN ({ph}) AND timestamp >= ?{cutoff_idx}
           AND duration_ms IS NOT NULL AND duration_ms > 0 AND status = 'success'
         GROUP BY bucket_start ORDER BY bucket_start",
        bucket = bucket_size,
        ph = placeholders.join(","),
        cutoff_idx = node_names.len() + 1
    );
    let mut sql_params: Vec<SqlValue> = node_names
        .iter()
        .map(|n| SqlValue::Text(n.clone()))
        .collect();
    sql_params.push(SqlValue::Text(cutoff));

    let mut stmt = conn.prepare(&query)?;
    let rows = stmt
        .query_map(params_from_iter(sql_params.iter()), |row| {
            let start: i64 = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok(json!({
                "bucket_start_ms": start,
                "bucket_end_ms": start + bucket_size,
                "count": count,
                "label": format!("{}-{}ms", start, start + bucket_size),
            }))
        })?
        .filter_map(|r| r.ok())
        .collect();
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Location;

    fn event_at(seconds_ago: i64, category: TrafficCategory, size: i64) -> Arc<TrafficEvent> {
        let ts = Utc::now() - ChronoDuration::seconds(seconds_ago);
        Arc::new(TrafficEvent {
            timestamp: ts,
            ts_unix: ts.timestamp_micros() as f64 / 1e6,
            action: "GET".to_string(),
            status: EventStatus::Success,
            size,
            piece_id: None,
            satellite_id: "sat".to_string(),
            remote_ip: None,
            location: Location::default(),
            error_reason: None,
            node_name: "n".to_string(),
            duration_ms: None,
            category,
        })
    }

    #[test]
    fn test_historical_performance_zero_fills() {
        let events = vec![
            event_at(30, TrafficCategory::Get, 1_000_000),
            event_at(40, TrafficCategory::Put, 500_000),
        ];
        let data = historical_performance(&events, 30, 2);
        // Every bin in the window is present even with only two events
        assert!(data.len() >= 29);
        let total_egress: i64 = data
            .iter()
            .map(|b| b["egress_bytes"].as_i64().unwrap())
            .sum();
        assert_eq!(total_egress, 1_000_000);
        // Final bin is a full bin, not the in-progress one
        assert!(data.iter().all(|b| b["bin_duration_seconds"] == 2));
    }

    #[test]
    fn test_historical_performance_empty_input() {
        let data = historical_performance(&[], 10, 2);
        assert!(!data.is_empty());
        assert!(data.iter().all(|b| b["total_ops"] == 0));
    }

    #[test]
    fn test_percentiles_nearest_rank() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        let pcts = calculate_percentiles(&values, &[50, 95, 99]);
        assert!((pcts["p50"] - 50.0).abs() < 1.0);
        assert!((pcts["p95"] - 95.0).abs() < 1.0);
        assert!((pcts["p99"] - 99.0).abs() < 1.0);

        let empty = calculate_percentiles(&[], &[50]);
        assert_eq!(empty["p50"], 0.0);
    }

    #[test]
    fn test_percentiles_monotonic() {
        let values = [12.0, 5.0, 80.0, 33.0, 7.0, 41.0];
        let pcts = calculate_percentiles(&values, &[50, 95, 99]);
        assert!(pcts["p50"] <= pcts["p95"]);
        assert!(pcts["p95"] <= pcts["p99"]);
    }

    #[test]
    fn test_latency_analysis_ignores_failures() {
        let rows = vec![
            (TrafficCategory::Get, EventStatus::Success, 100),
            (TrafficCategory::Get, EventStatus::Success, 200),
            (TrafficCategory::Get, EventStatus::Failed, 9_999),
            (TrafficCategory::Put, EventStatus::Success, 50),
            (TrafficCategory::GetRepair, EventStatus::Success, 75),
        ];
        let stats = analyze_latency_data(&rows);
        assert_eq!(stats["get"]["count"], 2);
        assert_eq!(stats["put"]["count"], 1);
        // Repair latency counts toward "all" but has no dedicated class
        assert_eq!(stats["all"]["count"], 4);
        assert_eq!(stats["audit"]["count"], 0);
        assert_eq!(stats["get"]["max"], 200.0);
    }

    #[test]
    fn test_live_bin_shape() {
        let events = vec![
            event_at(0, TrafficCategory::Get, 250_000),
            event_at(0, TrafficCategory::Put, 250_000),
        ];
        let bin = live_performance_bin(&events, 2);
        assert_eq!(bin["total_ops"], 2);
        assert_eq!(bin["egress_bytes"], 250_000);
        assert_eq!(bin["ingress_bytes"], 250_000);
        assert_eq!(bin["egress_mbps"], 1.0);
    }
}
