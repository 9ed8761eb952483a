/// Alert Manager
///
/// Central alert generation: dedup key + cooldown, confirmed persistence,
/// node-scoped broadcast, and best-effort notification dispatch. Threshold
/// evaluators feed it from the pollers and the anomaly detector.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config;
use crate::db;
use crate::db_writer::DbHandle;
use crate::metrics;
use crate::notifications::NotificationHandler;
use crate::types::{AlertRecord, InsightRecord, Severity};
use crate::websocket::WsHub;

pub struct AlertManager {
    db: DbHandle,
    hub: Arc<WsHub>,
    notifications: Arc<NotificationHandler>,
    cooldown: Mutex<HashMap<String, DateTime<Utc>>>,
    active: Mutex<HashMap<String, AlertRecord>>,
}

impl AlertManager {
    pub fn new(db: DbHandle, hub: Arc<WsHub>, notifications: Arc<NotificationHandler>) -> Self {
        Self {
            db,
            hub,
            notifications,
            cooldown: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Dedup key: `node:type[:satellite][:metric]`
    fn alert_key(node_name: &str, alert_type: &str, metadata: &Value) -> String {
        let mut parts = vec![node_name.to_string(), alert_type.to_string()];
        if let Some(satellite) = metadata["satellite"].as_str() {
            parts.push(satellite.to_string());
        }
        if let Some(metric) = metadata["metric_name"].as_str() {
            parts.push(metric.to_string());
        }
        parts.join(":")
    }

    async fn within_cooldown(&self, key: &str) -> bool {
        let cooldown = self.cooldown.lock().await;
        match cooldown.get(key) {
            Some(last) => {
                let elapsed = Utc::now() - *last;
                elapsed.num_seconds() < config::alert_cooldown_minutes() * 60
            }
            None => false,
        }
    }

    /// Generate one alert: suppressed inside the cooldown window, otherwise
    /// persisted, cached, broadcast scoped to the node, and dispatched to
    /// notification adapters. Returns None when suppressed or persistence
    /// failed.
    pub async fn generate_alert(
        &self,
        node_name: &str,
        alert_type: &str,
        severity: Severity,
        title: &str,
        message: &str,
        metadata: Value,
    ) -> Option<AlertRecord> {
        let key = Self::alert_key(node_name, alert_type, &metadata);
        if self.within_cooldown(&key).await {
            return None;
        }

        let alert = AlertRecord {
            timestamp: Utc::now(),
            node_name: node_name.to_string(),
            alert_type: alert_type.to_string(),
            severity,
            title: title.to_string(),
            message: message.to_string(),
            metadata: metadata.clone(),
        };

        // Persistence must be confirmed before the alert is visible anywhere
        let alert_id = self.db.write_alert(alert.clone()).await?;

        {
            let mut cooldown = self.cooldown.lock().await;
            cooldown.insert(key.clone(), alert.timestamp);
        }
        {
            let mut active = self.active.lock().await;
            active.insert(key, alert.clone());
        }
        metrics::ALERTS_GENERATED
            .with_label_values(&[severity.as_str()])
            .inc();

        self.hub
            .broadcast(
                &json!({
                    "type": "new_alert",
                    "alert": {
                        "id": alert_id,
                        "timestamp": crate::types::iso_micros(&alert.timestamp),
                        "node_name": alert.node_name,
                        "alert_type": alert.alert_type,
                        "severity": alert.severity.as_str(),
                        "title": alert.title,
                        "message": alert.message,
                        "metadata": alert.metadata,
                    }
                }),
                Some(node_name),
            )
            .await;

        // Fire-and-forget: adapter failures never reach the caller
        let notifications = Arc::clone(&self.notifications);
        let alert_for_dispatch = alert.clone();
        tokio::spawn(async move {
            let mut details = json!({
                "node_name": alert_for_dispatch.node_name,
                "title": alert_for_dispatch.title,
            });
            if let (Some(details_map), Some(meta_map)) =
                (details.as_object_mut(), alert_for_dispatch.metadata.as_object())
            {
                for (k, v) in meta_map {
                    details_map.insert(k.clone(), v.clone());
                }
            }
            notifications
                .send_notification(
                    &alert_for_dispatch.alert_type,
                    alert_for_dispatch.severity.as_str(),
                    &alert_for_dispatch.message,
                    &details,
                )
                .await;
        });

        tracing::info!(
            node = node_name,
            severity = severity.as_str(),
            "generated alert: {}",
            title
        );
        Some(alert)
    }

    /// Threshold checks on the latest per-satellite reputation rows.
    pub async fn evaluate_reputation_alerts(&self, node_name: &str, reputation_data: &[Value]) {
        for sat_data in reputation_data {
            let satellite = sat_data["satellite"].as_str().unwrap_or("").to_string();
            let audit_score = sat_data["audit_score"].as_f64();
            let suspension_score = sat_data["suspension_score"].as_f64();
            let online_score = sat_data["online_score"].as_f64();
            let is_disqualified = sat_data["is_disqualified"].as_bool().unwrap_or(false);
            let is_suspended = sat_data["is_suspended"].as_bool().unwrap_or(false);

            if is_disqualified {
                self.generate_alert(
                    node_name,
                    "node_disqualified",
                    Severity::Critical,
                    &format!("Node Disqualified on {}", satellite),
                    &format!("Node has been disqualified from {}. This is permanent.", satellite),
                    json!({"satellite": satellite}),
                )
                .await;
            }

            if is_suspended {
                self.generate_alert(
                    node_name,
                    "node_suspended",
                    Severity::Critical,
                    &format!("Node Suspended on {}", satellite),
                    &format!(
                        "Node has been suspended on {}. Review and fix issues immediately.",
                        satellite
                    ),
                    json!({"satellite": satellite}),
                )
                .await;
            }

            if let Some(score) = audit_score {
                if score < config::audit_score_critical() {
                    self.generate_alert(
                        node_name,
                        "audit_score_critical",
                        Severity::Critical,
                        &format!("Critical Audit Score: {:.2}%", score),
                        &format!(
                            "Audit score on {} is critically low. Risk of disqualification.",
                            satellite
                        ),
                        json!({"satellite": satellite, "score": score}),
                    )
                    .await;
                } else if score < config::audit_score_warning() {
                    self.generate_alert(
                        node_name,
                        "audit_score_warning",
                        Severity::Warning,
                        &format!("Low Audit Score: {:.2}%", score),
                        &format!("Audit score on {} is below threshold. Monitor closely.", satellite),
                        json!({"satellite": satellite, "score": score}),
                    )
                    .await;
                }
            }

            if let Some(score) = suspension_score {
                if score < config::suspension_score_critical() {
                    self.generate_alert(
                        node_name,
                        "suspension_risk",
                        Severity::Critical,
                        &format!("Suspension Risk: {:.2}%", score),
                        &format!(
                            "Suspension score on {} is critically low. Node may be suspended soon.",
                            satellite
                        ),
                        json!({"satellite": satellite, "score": score}),
                    )
                    .await;
                }
            }

            if let Some(score) = online_score {
                if score < config::online_score_warning() {
                    self.generate_alert(
                        node_name,
                        "uptime_warning",
                        Severity::Warning,
                        &format!("Low Uptime Score: {:.2}%", score),
                        &format!("Online score on {} indicates connectivity issues.", satellite),
                        json!({"satellite": satellite, "score": score}),
                    )
                    .await;
                }
            }
        }
    }

    /// Capacity and forecast checks on the latest storage snapshot.
    pub async fn evaluate_storage_alerts(
        &self,
        node_name: &str,
        storage_data: &Value,
        days_until_full: Option<f64>,
    ) {
        let used_percent = storage_data["used_percent"].as_f64().unwrap_or(0.0);

        if used_percent >= config::storage_critical_percent() {
            self.generate_alert(
                node_name,
                "storage_critical",
                Severity::Critical,
                &format!("Storage Critical: {:.1}% Full", used_percent),
                "Storage is critically full. Add capacity immediately to avoid service interruption.",
                json!({"used_percent": used_percent}),
            )
            .await;
        } else if used_percent >= config::storage_warning_percent() {
            self.generate_alert(
                node_name,
                "storage_warning",
                Severity::Warning,
                &format!("Storage Warning: {:.1}% Full", used_percent),
                "Storage is approaching capacity. Consider adding more disk space.",
                json!({"used_percent": used_percent}),
            )
            .await;
        }

        if let Some(days) = days_until_full {
            if days <= config::storage_forecast_critical_days() {
                self.generate_alert(
                    node_name,
                    "storage_forecast_critical",
                    Severity::Critical,
                    "Disk Will Be Full Soon",
                    &format!(
                        "At current growth rate, disk will be full in {:.1} days. Add capacity immediately.",
                        days
                    ),
                    json!({"days_until_full": days}),
                )
                .await;
            } else if days <= config::storage_forecast_warning_days() {
                self.generate_alert(
                    node_name,
                    "storage_forecast_warning",
                    Severity::Warning,
                    "Disk Capacity Warning",
                    &format!(
                        "At current growth rate, disk will be full in {:.1} days. Plan capacity expansion.",
                        days
                    ),
                    json!({"days_until_full": days}),
                )
                .await;
            }
        }
    }

    /// P99 threshold checks from the latency analyzer.
    pub async fn evaluate_latency_alerts(&self, node_name: &str, p99: Option<f64>) {
        let Some(p99) = p99 else { return };
        if p99 >= config::latency_critical_ms() {
            self.generate_alert(
                node_name,
                "latency_critical",
                Severity::Critical,
                &format!("Critical Latency: {:.0}ms", p99),
                "P99 latency is critically high. Check system resources and network.",
                json!({"p99_ms": p99}),
            )
            .await;
        } else if p99 >= config::latency_warning_ms() {
            self.generate_alert(
                node_name,
                "latency_warning",
                Severity::Warning,
                &format!("High Latency: {:.0}ms", p99),
                "P99 latency is elevated. Monitor for performance issues.",
                json!({"p99_ms": p99}),
            )
            .await;
        }
    }

    /// Escalate warning/critical anomaly insights into alerts.
    pub async fn process_anomalies(&self, findings: &[InsightRecord]) {
        for finding in findings {
            if finding.severity == Severity::Info {
                continue;
            }
            self.generate_alert(
                &finding.node_name,
                &finding.insight_type,
                finding.severity,
                &finding.title,
                &finding.description,
                finding.metadata.clone(),
            )
            .await;
        }
    }

    /// Acknowledge an alert, then broadcast the state change.
    pub async fn acknowledge_alert(&self, alert_id: i64) -> bool {
        let success = self.db.acknowledge_alert(alert_id).await;
        if success {
            tracing::info!(alert_id, "alert acknowledged");
            self.hub
                .broadcast(&json!({"type": "alert_acknowledged", "alert_id": alert_id}), None)
                .await;
        }
        success
    }

    /// Active (unacknowledged, unresolved) alerts from the database.
    pub async fn active_alerts(&self, node_names: Option<&[String]>) -> Vec<Value> {
        let db_path = self.db.db_path.clone();
        let names = node_names.map(|n| n.to_vec());
        tokio::task::spawn_blocking(move || db::get_active_alerts(&db_path, names.as_deref()))
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default()
    }

    /// Counts of cached active alerts by severity.
    pub async fn alert_summary(&self) -> Value {
        let active = self.active.lock().await;
        let mut critical = 0;
        let mut warning = 0;
        let mut info = 0;
        for alert in active.values() {
            match alert.severity {
                Severity::Critical => critical += 1,
                Severity::Warning => warning += 1,
                Severity::Info => info += 1,
            }
        }
        json!({
            "critical": critical,
            "warning": warning,
            "info": info,
            "total": active.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db_writer;
    use crate::log_source::ClientGate;
    use tempfile::TempDir;
    use tokio::sync::watch;

    async fn manager() -> (Arc<AlertManager>, String, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("alerts.db").to_str().unwrap().to_string();
        db::init_db(&path).unwrap();
        let (tx, rx) = watch::channel(false);
        // The writer must outlive this fixture function
        std::mem::forget(tx);
        let handle = db_writer::start(path.clone(), rx);
        let hub = Arc::new(WsHub::new(Arc::new(ClientGate::new())));
        let manager = Arc::new(AlertManager::new(
            handle,
            hub,
            Arc::new(NotificationHandler::new()),
        ));
        (manager, path, dir)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_alert_cooldown_suppresses_duplicates() {
        let (manager, _path, _dir) = manager().await;

        let first = manager
            .generate_alert(
                "n",
                "storage_warning",
                Severity::Warning,
                "Storage Warning",
                "Storage is approaching capacity.",
                json!({}),
            )
            .await;
        assert!(first.is_some());

        // Same key inside the cooldown window is suppressed
        let second = manager
            .generate_alert(
                "n",
                "storage_warning",
                Severity::Warning,
                "Storage Warning",
                "Storage is approaching capacity.",
                json!({}),
            )
            .await;
        assert!(second.is_none());

        // Different satellite means a different dedup key
        let other_key = manager
            .generate_alert(
                "n",
                "storage_warning",
                Severity::Warning,
                "Storage Warning",
                "Storage is approaching capacity.",
                json!({"satellite": "sat-2"}),
            )
            .await;
        assert!(other_key.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cooldown_expiry_allows_regeneration() {
        let (manager, _path, _dir) = manager().await;
        manager
            .generate_alert("n", "t", Severity::Info, "T", "m", json!({}))
            .await
            .unwrap();
        // Rewind the stored cooldown stamp past the window
        {
            let mut cooldown = manager.cooldown.lock().await;
            for ts in cooldown.values_mut() {
                *ts = *ts - chrono::Duration::minutes(config::alert_cooldown_minutes() + 1);
            }
        }
        assert!(manager
            .generate_alert("n", "t", Severity::Info, "T", "m", json!({}))
            .await
            .is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reputation_thresholds() {
        let (manager, path, _dir) = manager().await;
        let rows = vec![json!({
            "satellite": "sat-1",
            "audit_score": 65.0,
            "suspension_score": 55.0,
            "online_score": 90.0,
            "is_disqualified": false,
            "is_suspended": false,
        })];
        manager.evaluate_reputation_alerts("n", &rows).await;

        let active = db::get_active_alerts(&path, None).unwrap();
        let types: Vec<&str> = active
            .iter()
            .map(|a| a["alert_type"].as_str().unwrap())
            .collect();
        assert!(types.contains(&"audit_score_critical"));
        assert!(types.contains(&"suspension_risk"));
        assert!(types.contains(&"uptime_warning"));
        assert!(!types.contains(&"audit_score_warning"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_storage_thresholds_and_summary() {
        let (manager, _path, _dir) = manager().await;
        manager
            .evaluate_storage_alerts("n", &json!({"used_percent": 96.0}), Some(5.0))
            .await;

        let summary = manager.alert_summary().await;
        assert_eq!(summary["critical"], 2);
        assert_eq!(summary["total"], 2);
    }
}
