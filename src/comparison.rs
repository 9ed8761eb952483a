/// Node Comparison
///
/// Side-by-side metrics for a set of nodes over a time range: traffic
/// success rates and volume, latency percentiles, and current-month
/// earnings. Backs the dashboard's comparison panel.

use chrono::{Duration, Utc};
use rusqlite::params;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::db;
use crate::db_utils::open_connection;
use crate::earnings;
use crate::performance;
use crate::server::AppContext;
use crate::types::iso_micros;

struct TrafficSummary {
    total_ops: i64,
    successful_ops: i64,
    egress_bytes: i64,
    ingress_bytes: i64,
}

fn traffic_summary(
    db_path: &str,
    node_name: &str,
    hours: i64,
) -> rusqlite::Result<TrafficSummary> {
    let cutoff = iso_micros(&(Utc::now() - Duration::hours(hours)));
    let conn = open_connection(db_path, true)?;
    conn.query_row(
        "SELECT COUNT(*),
                SUM(CASE WHEN status = 'success' THEN 1 ELSE 0 END),
                SUM(CASE WHEN action LIKE '%GET%' AND status = 'success' AND action != 'GET_AUDIT' THEN size ELSE 0 END),
                SUM(CASE WHEN action LIKE '%PUT%' AND status = 'success' THEN size ELSE 0 END)
         FROM events WHERE node_name = ?1 AND timestamp >= ?2",
        params![node_name, cutoff],
        |row| {
            Ok(TrafficSummary {
                total_ops: row.get::<_, Option<i64>>(0)?.unwrap_or(0),
                successful_ops: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                egress_bytes: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                ingress_bytes: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
            })
        },
    )
}

/// Build the `comparison_data` frame for the requested nodes.
pub async fn comparison_payload(
    ctx: &Arc<AppContext>,
    node_names: &[String],
    comparison_type: &str,
    time_range_hours: i64,
) -> Value {
    let period = earnings::period_of(&Utc::now());
    let mut entries = Vec::new();

    for node_name in node_names {
        if !ctx.node_names.contains(node_name) {
            continue;
        }

        let db_path = ctx.db.db_path.clone();
        let node = node_name.clone();
        let summary = tokio::task::spawn_blocking(move || {
            traffic_summary(&db_path, &node, time_range_hours)
        })
        .await
        .ok()
        .and_then(|r| r.ok());

        let db_path = ctx.db.db_path.clone();
        let latency_nodes = vec![node_name.clone()];
        let latency = tokio::task::spawn_blocking(move || {
            performance::latency_stats(&db_path, &latency_nodes, time_range_hours)
        })
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_else(|| json!({"statistics": {}}));

        let db_path = ctx.db.db_path.clone();
        let earnings_node = vec![node_name.clone()];
        let query_period = period.clone();
        let earnings_rows = tokio::task::spawn_blocking(move || {
            db::get_earnings_estimates(&db_path, &earnings_node, Some(&query_period), 31)
        })
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();
        let month_net: f64 = earnings_rows
            .iter()
            .map(|r| r["total_earnings_net"].as_f64().unwrap_or(0.0))
            .sum();

        let (total_ops, success_rate, egress, ingress) = match &summary {
            Some(s) if s.total_ops > 0 => (
                s.total_ops,
                s.successful_ops as f64 / s.total_ops as f64 * 100.0,
                s.egress_bytes,
                s.ingress_bytes,
            ),
            Some(s) => (s.total_ops, 0.0, s.egress_bytes, s.ingress_bytes),
            None => (0, 0.0, 0, 0),
        };

        entries.push(json!({
            "node_name": node_name,
            "total_ops": total_ops,
            "success_rate": (success_rate * 100.0).round() / 100.0,
            "egress_bytes": egress,
            "ingress_bytes": ingress,
            "latency_p50_ms": latency["statistics"]["all"]["p50"],
            "latency_p99_ms": latency["statistics"]["all"]["p99"],
            "month_earnings_net": (month_net * 100.0).round() / 100.0,
        }));
    }

    // Rank by the dimension the client asked about
    let rank_key = match comparison_type {
        "earnings" => "month_earnings_net",
        "latency" => "latency_p50_ms",
        _ => "success_rate",
    };
    let best = entries
        .iter()
        .max_by(|a, b| {
            let av = a[rank_key].as_f64().unwrap_or(0.0);
            let bv = b[rank_key].as_f64().unwrap_or(0.0);
            if comparison_type == "latency" {
                // Lower latency wins
                bv.partial_cmp(&av).unwrap_or(std::cmp::Ordering::Equal)
            } else {
                av.partial_cmp(&bv).unwrap_or(std::cmp::Ordering::Equal)
            }
        })
        .and_then(|e| e["node_name"].as_str().map(|s| s.to_string()));

    json!({
        "type": "comparison_data",
        "comparison_type": comparison_type,
        "time_range_hours": time_range_hours,
        "nodes": entries,
        "best_node": best,
    })
}
