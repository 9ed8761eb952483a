/// Storage Tracker
///
/// Polls disk capacity from the management API, derives percentages,
/// persists snapshots, and forecasts disk exhaustion by linear regression
/// over recent snapshots. The API's `available` figure is the remaining
/// allocation, so the denominator for percentages is used + available;
/// trash is tracked separately.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::alerts::AlertManager;
use crate::api_client::NodeApiClient;
use crate::config;
use crate::db;
use crate::db_writer::{DbCommand, DbHandle};
use crate::types::StorageSnapshot;
use crate::websocket::WsHub;

/// Forecast windows in days; the 7-day window is the headline figure
pub const FORECAST_WINDOWS_DAYS: [i64; 3] = [1, 7, 30];

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Build a complete snapshot from raw API byte counts.
pub fn snapshot_from_disk_space(
    node_name: &str,
    used: i64,
    available: i64,
    trash: i64,
) -> StorageSnapshot {
    let total = used + available;
    let (used_percent, trash_percent, available_percent) = if total > 0 {
        (
            round2(used as f64 / total as f64 * 100.0),
            round2(trash as f64 / total as f64 * 100.0),
            round2(available as f64 / total as f64 * 100.0),
        )
    } else {
        (0.0, 0.0, 0.0)
    };

    StorageSnapshot {
        timestamp: Utc::now(),
        node_name: node_name.to_string(),
        total_bytes: Some(total),
        used_bytes: Some(used),
        available_bytes: Some(available),
        trash_bytes: Some(trash),
        used_percent: Some(used_percent),
        trash_percent: Some(trash_percent),
        available_percent: Some(available_percent),
    }
}

/// Partial snapshot from a log line that only reveals remaining space.
pub fn partial_snapshot(node_name: &str, available_bytes: i64) -> StorageSnapshot {
    StorageSnapshot {
        timestamp: Utc::now(),
        node_name: node_name.to_string(),
        total_bytes: None,
        used_bytes: None,
        available_bytes: Some(available_bytes),
        trash_bytes: None,
        used_percent: None,
        trash_percent: None,
        available_percent: None,
    }
}

/// Least-squares slope of used_bytes against time-in-days. Partial
/// snapshots without used_bytes are ignored.
fn regression_slope(history: &[(DateTime<Utc>, i64)]) -> Option<f64> {
    if history.len() < 2 {
        return None;
    }
    let n = history.len() as f64;
    let xs: Vec<f64> = history
        .iter()
        .map(|(t, _)| t.timestamp() as f64 / 86400.0)
        .collect();
    let ys: Vec<f64> = history.iter().map(|(_, used)| *used as f64).collect();

    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = ys.iter().sum();
    let sum_xy: f64 = xs.iter().zip(&ys).map(|(x, y)| x * y).sum();
    let sum_x2: f64 = xs.iter().map(|x| x * x).sum();

    let denominator = n * sum_x2 - sum_x * sum_x;
    if denominator == 0.0 {
        return None;
    }
    Some((n * sum_xy - sum_x * sum_y) / denominator)
}

/// Forecast for one lookback window: growth rate and days until full.
/// `days_until_full` is None when usage is flat or shrinking.
pub fn forecast_from_history(
    history: &[(DateTime<Utc>, i64)],
    current_available: i64,
) -> Option<Value> {
    let slope = regression_slope(history)?;
    let days_until_full = if slope > 0.0 {
        Some(round_tenth(current_available as f64 / slope))
    } else {
        None
    };
    Some(json!({
        "growth_rate_bytes_per_day": slope.round(),
        "growth_rate_gb_per_day": round2(slope / 1024f64.powi(3)),
        "days_until_full": days_until_full,
        "data_points": history.len(),
    }))
}

fn round_tenth(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Forecasts over the standard windows; the 7-day entry is the headline.
pub async fn calculate_storage_forecast(
    db_path: &str,
    node_name: &str,
    current_available: i64,
) -> Option<Value> {
    let path = db_path.to_string();
    let node = node_name.to_string();
    let history = tokio::task::spawn_blocking(move || {
        let mut per_window = HashMap::new();
        for days in FORECAST_WINDOWS_DAYS {
            let start = crate::types::iso_micros(&(Utc::now() - chrono::Duration::days(days)));
            let end = crate::types::iso_micros(&(Utc::now() + chrono::Duration::seconds(1)));
            if let Ok(samples) = db::storage_samples_for_period(&path, &node, &start, &end) {
                per_window.insert(days, samples);
            }
        }
        per_window
    })
    .await
    .ok()?;

    let headline = forecast_from_history(history.get(&7)?, current_available)?;
    let mut windows = serde_json::Map::new();
    for days in FORECAST_WINDOWS_DAYS {
        if let Some(samples) = history.get(&days) {
            if let Some(forecast) = forecast_from_history(samples, current_available) {
                windows.insert(format!("{}d", days), forecast);
            }
        }
    }

    let mut result = headline;
    result["windows"] = Value::Object(windows);
    Some(result)
}

/// One poll: fetch disk space, persist the snapshot, forecast exhaustion.
pub async fn track_storage(
    node_name: &str,
    client: &NodeApiClient,
    db_handle: &DbHandle,
) -> Option<(StorageSnapshot, Option<Value>)> {
    let dashboard = client.get_dashboard().await?;
    let disk_space = dashboard.get("diskSpace")?;

    let used = disk_space["used"].as_i64().unwrap_or(0);
    let available = disk_space["available"].as_i64().unwrap_or(0);
    let trash = disk_space["trash"].as_i64().unwrap_or(0);

    let snapshot = snapshot_from_disk_space(node_name, used, available, trash);
    db_handle
        .send(DbCommand::StorageSnapshot(snapshot.clone()))
        .await;

    let forecast = calculate_storage_forecast(&db_handle.db_path, node_name, available).await;
    Some((snapshot, forecast))
}

pub fn snapshot_to_json(snapshot: &StorageSnapshot) -> Value {
    json!({
        "timestamp": crate::types::iso_micros(&snapshot.timestamp),
        "node_name": snapshot.node_name,
        "total_bytes": snapshot.total_bytes,
        "used_bytes": snapshot.used_bytes,
        "available_bytes": snapshot.available_bytes,
        "trash_bytes": snapshot.trash_bytes,
        "used_percent": snapshot.used_percent,
        "trash_percent": snapshot.trash_percent,
        "available_percent": snapshot.available_percent,
    })
}

/// Periodic storage poller across all API-capable nodes.
pub fn spawn_storage_poller(
    clients: HashMap<String, Arc<NodeApiClient>>,
    db_handle: DbHandle,
    hub: Arc<WsHub>,
    alerts: Arc<AlertManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        if clients.is_empty() {
            tracing::info!("no management APIs configured, storage poller idle");
            return;
        }
        tracing::info!("storage polling task started");
        let interval = std::time::Duration::from_secs(config::node_api_poll_interval_secs());

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

            for (node_name, client) in &clients {
                if !client.is_available() {
                    continue;
                }
                let Some((snapshot, forecast)) =
                    track_storage(node_name, client, &db_handle).await
                else {
                    tracing::debug!(node = node_name.as_str(), "storage poll returned nothing");
                    continue;
                };

                let snapshot_json = snapshot_to_json(&snapshot);
                let days_until_full = forecast
                    .as_ref()
                    .and_then(|f| f["days_until_full"].as_f64());
                alerts
                    .evaluate_storage_alerts(node_name, &snapshot_json, days_until_full)
                    .await;

                hub.broadcast(
                    &json!({
                        "type": "storage_data",
                        "data": [{
                            "snapshot": snapshot_json,
                            "forecast": forecast,
                        }],
                    }),
                    Some(node_name),
                )
                .await;
            }
        }
        tracing::info!("storage polling task cancelled");
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_percentages_use_used_plus_available() {
        // available is the REMAINING space; total is used + available
        let snapshot = snapshot_from_disk_space("n", 8_000_000_000, 10_000_000_000, 1_000_000_000);
        assert_eq!(snapshot.total_bytes, Some(18_000_000_000));
        let used_percent = snapshot.used_percent.unwrap();
        assert!((used_percent - round2(8.0 / 18.0 * 100.0)).abs() < 1e-9);
        let trash_percent = snapshot.trash_percent.unwrap();
        assert!((trash_percent - round2(1.0 / 18.0 * 100.0)).abs() < 1e-9);
    }

    #[test]
    fn test_zero_total_yields_zero_percentages() {
        let snapshot = snapshot_from_disk_space("n", 0, 0, 0);
        assert_eq!(snapshot.used_percent, Some(0.0));
    }

    #[test]
    fn test_forecast_positive_growth() {
        let base = Utc::now() - Duration::days(6);
        // 100 GB/day growth
        let history: Vec<(DateTime<Utc>, i64)> = (0..7)
            .map(|day| {
                (
                    base + Duration::days(day),
                    (day as i64) * 100 * 1024i64.pow(3),
                )
            })
            .collect();
        let available = 500 * 1024i64.pow(3);
        let forecast = forecast_from_history(&history, available).unwrap();
        let days = forecast["days_until_full"].as_f64().unwrap();
        assert!((days - 5.0).abs() < 0.2, "expected ~5 days, got {}", days);
    }

    #[test]
    fn test_forecast_flat_usage_never_fills() {
        let base = Utc::now() - Duration::days(3);
        let history: Vec<(DateTime<Utc>, i64)> = (0..4)
            .map(|day| (base + Duration::days(day), 1_000_000))
            .collect();
        let forecast = forecast_from_history(&history, 1_000_000).unwrap();
        assert!(forecast["days_until_full"].is_null());
    }

    #[test]
    fn test_forecast_requires_two_points() {
        let history = vec![(Utc::now(), 42i64)];
        assert!(forecast_from_history(&history, 100).is_none());
    }

    #[test]
    fn test_partial_snapshot_only_available() {
        let snapshot = partial_snapshot("n", 123);
        assert_eq!(snapshot.available_bytes, Some(123));
        assert!(snapshot.used_bytes.is_none());
        assert!(snapshot.used_percent.is_none());
    }
}
