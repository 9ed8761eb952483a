/// Reputation Tracker
///
/// Polls per-satellite reputation scores from each node's management API,
/// normalizes them to percentages, persists history, and feeds the alert
/// manager. Losing reputation is how nodes die; this poller exists to make
/// that visible early.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::alerts::AlertManager;
use crate::api_client::NodeApiClient;
use crate::config;
use crate::db_writer::{DbCommand, DbHandle};
use crate::types::ReputationSample;
use crate::websocket::WsHub;

/// Composite health score (0-100): audit 40%, suspension 30%, online 30%.
pub fn calculate_reputation_health_score(row: &Value) -> f64 {
    let audit = row["audit_score"].as_f64().unwrap_or(100.0);
    let suspension = row["suspension_score"].as_f64().unwrap_or(100.0);
    let online = row["online_score"].as_f64().unwrap_or(100.0);
    let score = audit * 0.4 + suspension * 0.3 + online * 0.3;
    (score * 100.0).round() / 100.0
}

/// The satellites endpoint has shipped both a bare list and a keyed map of
/// lists; flatten either into one list of satellite objects.
fn flatten_satellites(data: &Value) -> Vec<&Value> {
    match data {
        Value::Array(list) => list.iter().collect(),
        Value::Object(map) => {
            let mut flat = Vec::new();
            for value in map.values() {
                match value {
                    Value::Array(inner) => flat.extend(inner.iter()),
                    Value::Object(_) => flat.push(value),
                    _ => {}
                }
            }
            flat
        }
        _ => vec![],
    }
}

/// One poll: fetch, normalize to percentages, persist. Returns the samples
/// for alert evaluation.
pub async fn track_reputation(
    node_name: &str,
    client: &NodeApiClient,
    db: &DbHandle,
) -> Option<Vec<ReputationSample>> {
    let satellites_data = client.get_satellites().await?;
    let satellites = flatten_satellites(&satellites_data);
    if satellites.is_empty() {
        tracing::warn!(node = node_name, "no satellite data found");
        return None;
    }

    let timestamp = Utc::now();
    let mut records = Vec::new();
    for sat_data in satellites {
        let Some(sat_id) = sat_data["id"].as_str() else {
            continue;
        };
        tracing::debug!(
            node = node_name,
            satellite = crate::telemetry::truncate_id(sat_id, 12).as_str(),
            "processing satellite reputation"
        );
        let audit = &sat_data["audit"];
        let suspension = &sat_data["suspension"];
        let online = &sat_data["online"];

        records.push(ReputationSample {
            timestamp,
            node_name: node_name.to_string(),
            satellite: sat_id.to_string(),
            audit_score: Some(audit["score"].as_f64().unwrap_or(1.0) * 100.0),
            suspension_score: Some(suspension["score"].as_f64().unwrap_or(1.0) * 100.0),
            online_score: Some(online["score"].as_f64().unwrap_or(1.0) * 100.0),
            audit_success_count: audit["successCount"].as_i64().unwrap_or(0),
            audit_total_count: audit["totalCount"].as_i64().unwrap_or(0),
            is_disqualified: !sat_data["disqualified"].is_null(),
            is_suspended: !sat_data["suspended"].is_null(),
        });
    }

    if records.is_empty() {
        return None;
    }
    db.send(DbCommand::Reputation(records.clone())).await;
    Some(records)
}

fn samples_to_rows(samples: &[ReputationSample]) -> Vec<Value> {
    samples
        .iter()
        .map(|s| {
            let mut row = json!({
                "timestamp": crate::types::iso_micros(&s.timestamp),
                "node_name": s.node_name,
                "satellite": s.satellite,
                "audit_score": s.audit_score,
                "suspension_score": s.suspension_score,
                "online_score": s.online_score,
                "audit_success_count": s.audit_success_count,
                "audit_total_count": s.audit_total_count,
                "is_disqualified": s.is_disqualified,
                "is_suspended": s.is_suspended,
            });
            let health = calculate_reputation_health_score(&row);
            row["health_score"] = json!(health);
            row
        })
        .collect()
}

/// Periodic reputation poller across all API-capable nodes.
pub fn spawn_reputation_poller(
    clients: HashMap<String, Arc<NodeApiClient>>,
    db: DbHandle,
    hub: Arc<WsHub>,
    alerts: Arc<AlertManager>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        if clients.is_empty() {
            tracing::info!("no management APIs configured, reputation poller idle");
            return;
        }
        tracing::info!("reputation polling task started");
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
                match track_reputation(node_name, client, &db).await {
                    Some(samples) => {
                        let rows = samples_to_rows(&samples);
                        alerts.evaluate_reputation_alerts(node_name, &rows).await;
                        hub.broadcast(
                            &json!({"type": "reputation_data", "data": rows}),
                            Some(node_name),
                        )
                        .await;
                    }
                    None => {
                        tracing::debug!(node = node_name.as_str(), "reputation poll returned nothing");
                    }
                }
            }
        }
        tracing::info!("reputation polling task cancelled");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_score_weighting() {
        let row = json!({"audit_score": 80.0, "suspension_score": 90.0, "online_score": 100.0});
        assert!((calculate_reputation_health_score(&row) - 89.0).abs() < 1e-9);
    }

    #[test]
    fn test_health_score_defaults_to_perfect() {
        assert!((calculate_reputation_health_score(&json!({})) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_flatten_satellites_handles_both_shapes() {
        let list = json!([{"id": "a"}, {"id": "b"}]);
        assert_eq!(flatten_satellites(&list).len(), 2);

        let map = json!({"satellites": [{"id": "a"}], "extra": {"id": "b"}});
        assert_eq!(flatten_satellites(&map).len(), 2);

        assert!(flatten_satellites(&json!("nope")).is_empty());
    }
}
