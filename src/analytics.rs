/// Analytics Engine
///
/// Statistical primitives (baselines, z-scores, trends, percentiles,
/// forecasts) plus reputation/storage health analysis that produces
/// persisted insights.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::config;
use crate::db;
use crate::db_writer::{DbCommand, DbHandle};
use crate::types::{BaselineStats, InsightRecord, Severity};

/// Minimum snapshots before a storage growth forecast is attempted
const MIN_STORAGE_DATA_POINTS_FOR_FORECAST: usize = 3;

pub struct AnalyticsEngine {
    db: DbHandle,
    baselines: Mutex<HashMap<String, BaselineStats>>,
}

impl AnalyticsEngine {
    pub fn new(db: DbHandle) -> Self {
        Self {
            db,
            baselines: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(node_name: &str, metric_name: &str, window_hours: i64) -> String {
        format!("{}:{}:{}", node_name, metric_name, window_hours)
    }

    /// Compute and persist baseline statistics for a metric. Requires at
    /// least two samples.
    pub async fn calculate_baseline(
        &self,
        node_name: &str,
        metric_name: &str,
        values: &[f64],
        window_hours: i64,
    ) -> Option<BaselineStats> {
        if values.len() < 2 {
            return None;
        }

        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let stats = BaselineStats {
            mean,
            std_dev: variance.sqrt(),
            min: values.iter().cloned().fold(f64::INFINITY, f64::min),
            max: values.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            count: values.len() as i64,
        };

        self.db
            .send(DbCommand::Baseline {
                node_name: node_name.to_string(),
                metric_name: metric_name.to_string(),
                window_hours,
                stats: stats.clone(),
            })
            .await;

        let key = Self::cache_key(node_name, metric_name, window_hours);
        self.baselines.lock().await.insert(key, stats.clone());
        Some(stats)
    }

    /// Read-through baseline lookup: process cache first, then the DB.
    pub async fn get_baseline(
        &self,
        node_name: &str,
        metric_name: &str,
        window_hours: i64,
    ) -> Option<BaselineStats> {
        let key = Self::cache_key(node_name, metric_name, window_hours);
        if let Some(stats) = self.baselines.lock().await.get(&key) {
            return Some(stats.clone());
        }

        let db_path = self.db.db_path.clone();
        let node = node_name.to_string();
        let metric = metric_name.to_string();
        let loaded = tokio::task::spawn_blocking(move || {
            db::get_baseline(&db_path, &node, &metric, window_hours)
        })
        .await
        .ok()?
        .ok()??;

        self.baselines.lock().await.insert(key, loaded.clone());
        Some(loaded)
    }

    /// Z-score against a baseline; undefined (None) when the deviation is 0.
    pub fn calculate_z_score(value: f64, baseline: &BaselineStats) -> Option<f64> {
        if baseline.std_dev == 0.0 {
            return None;
        }
        Some((value - baseline.mean) / baseline.std_dev)
    }

    /// Trend over an ordered series: slope from simple linear regression,
    /// normalized by |mean|. Returns ("stable"|"increasing"|"decreasing", slope).
    pub fn detect_trend(values: &[f64], threshold: f64) -> (&'static str, f64) {
        if values.len() < 3 {
            return ("stable", 0.0);
        }
        let n = values.len() as f64;
        let x_mean = (n - 1.0) / 2.0;
        let y_mean = values.iter().sum::<f64>() / n;

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (i, y) in values.iter().enumerate() {
            let dx = i as f64 - x_mean;
            numerator += dx * (y - y_mean);
            denominator += dx * dx;
        }
        if denominator == 0.0 {
            return ("stable", 0.0);
        }
        let slope = numerator / denominator;
        let normalized = if y_mean != 0.0 { slope / y_mean.abs() } else { slope };

        if normalized.abs() < threshold {
            ("stable", slope)
        } else if normalized > 0.0 {
            ("increasing", slope)
        } else {
            ("decreasing", slope)
        }
    }

    /// Nearest-rank percentile with linear interpolation. None on empty input.
    pub fn calculate_percentile(values: &[f64], percentile: f64) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = values.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let index = (percentile / 100.0) * (sorted.len() - 1) as f64;
        let lower = index.floor() as usize;
        if index.fract() == 0.0 {
            return Some(sorted[lower]);
        }
        let upper = (lower + 1).min(sorted.len() - 1);
        let fraction = index - lower as f64;
        Some(sorted[lower] + (sorted[upper] - sorted[lower]) * fraction)
    }

    /// First-to-last rate of change per hour within the window
    pub fn calculate_rate_of_change(
        values: &[(DateTime<Utc>, f64)],
        window_hours: i64,
    ) -> Option<f64> {
        if values.len() < 2 {
            return None;
        }
        let mut sorted: Vec<(DateTime<Utc>, f64)> = values.to_vec();
        sorted.sort_by_key(|(t, _)| *t);

        let cutoff = Utc::now() - Duration::hours(window_hours);
        let windowed: Vec<&(DateTime<Utc>, f64)> =
            sorted.iter().filter(|(t, _)| *t >= cutoff).collect();
        if windowed.len() < 2 {
            return None;
        }

        let (first_time, first_value) = windowed[0];
        let (last_time, last_value) = windowed[windowed.len() - 1];
        let hours = (*last_time - *first_time).num_seconds() as f64 / 3600.0;
        if hours == 0.0 {
            return None;
        }
        Some((last_value - first_value) / hours)
    }

    /// Linear forecast from the most recent value and the recent rate
    pub fn forecast_linear(
        values: &[(DateTime<Utc>, f64)],
        forecast_hours: f64,
    ) -> Option<f64> {
        let rate = Self::calculate_rate_of_change(values, 24)?;
        let latest = values.iter().max_by_key(|(t, _)| *t)?.1;
        Some(latest + rate * forecast_hours)
    }

    /// Threshold checks on the latest reputation rows, producing insights.
    pub fn analyze_reputation_health(
        &self,
        node_name: &str,
        reputation_data: &[Value],
    ) -> Vec<InsightRecord> {
        let mut insights = Vec::new();
        let now = Utc::now();

        for sat_data in reputation_data {
            let satellite = sat_data["satellite"].as_str().unwrap_or("").to_string();
            let audit_score = sat_data["audit_score"].as_f64();
            let suspension_score = sat_data["suspension_score"].as_f64();
            let online_score = sat_data["online_score"].as_f64();

            if let Some(score) = audit_score {
                if score < config::audit_score_critical() {
                    insights.push(InsightRecord {
                        timestamp: now,
                        node_name: node_name.to_string(),
                        insight_type: "reputation_critical".to_string(),
                        severity: Severity::Critical,
                        title: format!("Critical Audit Score on {}", satellite),
                        description: format!(
                            "Audit score is {:.2}%, below critical threshold of {}%",
                            score,
                            config::audit_score_critical()
                        ),
                        category: Some("reputation".to_string()),
                        confidence: Some(1.0),
                        metadata: json!({"satellite": satellite, "score": score}),
                    });
                } else if score < config::audit_score_warning() {
                    insights.push(InsightRecord {
                        timestamp: now,
                        node_name: node_name.to_string(),
                        insight_type: "reputation_warning".to_string(),
                        severity: Severity::Warning,
                        title: format!("Low Audit Score on {}", satellite),
                        description: format!(
                            "Audit score is {:.2}%, below warning threshold of {}%",
                            score,
                            config::audit_score_warning()
                        ),
                        category: Some("reputation".to_string()),
                        confidence: Some(0.9),
                        metadata: json!({"satellite": satellite, "score": score}),
                    });
                }
            }

            if let Some(score) = suspension_score {
                if score < config::suspension_score_critical() {
                    insights.push(InsightRecord {
                        timestamp: now,
                        node_name: node_name.to_string(),
                        insight_type: "suspension_risk".to_string(),
                        severity: Severity::Critical,
                        title: format!("Suspension Risk on {}", satellite),
                        description: format!(
                            "Suspension score is {:.2}%, node may be suspended",
                            score
                        ),
                        category: Some("reputation".to_string()),
                        confidence: Some(1.0),
                        metadata: json!({"satellite": satellite, "score": score}),
                    });
                }
            }

            if let Some(score) = online_score {
                if score < config::online_score_warning() {
                    insights.push(InsightRecord {
                        timestamp: now,
                        node_name: node_name.to_string(),
                        insight_type: "uptime_warning".to_string(),
                        severity: Severity::Warning,
                        title: format!("Low Uptime Score on {}", satellite),
                        description: format!(
                            "Online score is {:.2}%, indicating connectivity issues",
                            score
                        ),
                        category: Some("uptime".to_string()),
                        confidence: Some(0.8),
                        metadata: json!({"satellite": satellite, "score": score}),
                    });
                }
            }
        }

        insights
    }

    /// Usage and growth-forecast checks over a node's storage history.
    pub fn analyze_storage_health(
        &self,
        node_name: &str,
        storage_history: &[Value],
    ) -> Vec<InsightRecord> {
        let mut insights = Vec::new();
        if storage_history.len() < 2 {
            return insights;
        }
        let now = Utc::now();
        let latest = &storage_history[storage_history.len() - 1];

        // Log-derived snapshots may store NULL percentages; recompute when
        // the raw byte counts allow it.
        let used_percent = latest["used_percent"].as_f64().or_else(|| {
            let used = latest["used_bytes"].as_f64()?;
            let total = latest["total_bytes"].as_f64()?;
            if total > 0.0 {
                Some(used / total * 100.0)
            } else {
                None
            }
        });

        if let Some(used_percent) = used_percent {
            if used_percent >= config::storage_critical_percent() {
                insights.push(InsightRecord {
                    timestamp: now,
                    node_name: node_name.to_string(),
                    insight_type: "storage_critical".to_string(),
                    severity: Severity::Critical,
                    title: "Critical Storage Usage".to_string(),
                    description: format!(
                        "Storage is {:.1}% full, exceeding critical threshold",
                        used_percent
                    ),
                    category: Some("storage".to_string()),
                    confidence: Some(1.0),
                    metadata: json!({"used_percent": used_percent}),
                });
            } else if used_percent >= config::storage_warning_percent() {
                insights.push(InsightRecord {
                    timestamp: now,
                    node_name: node_name.to_string(),
                    insight_type: "storage_warning".to_string(),
                    severity: Severity::Warning,
                    title: "High Storage Usage".to_string(),
                    description: format!(
                        "Storage is {:.1}% full, approaching capacity",
                        used_percent
                    ),
                    category: Some("storage".to_string()),
                    confidence: Some(0.9),
                    metadata: json!({"used_percent": used_percent}),
                });
            }
        }

        let values_with_time: Vec<(DateTime<Utc>, f64)> = storage_history
            .iter()
            .filter_map(|s| {
                let ts = DateTime::parse_from_rfc3339(s["timestamp"].as_str()?)
                    .ok()?
                    .with_timezone(&Utc);
                Some((ts, s["used_bytes"].as_f64()?))
            })
            .collect();

        if values_with_time.len() >= MIN_STORAGE_DATA_POINTS_FOR_FORECAST {
            if let Some(growth_rate) = Self::calculate_rate_of_change(&values_with_time, 168) {
                if growth_rate > 0.0 {
                    let available = latest["available_bytes"].as_f64().unwrap_or(0.0);
                    let days_until_full = available / growth_rate / 24.0;
                    let gb_per_day = growth_rate * 24.0 / 1024f64.powi(3);

                    if days_until_full < config::storage_forecast_critical_days() {
                        insights.push(InsightRecord {
                            timestamp: now,
                            node_name: node_name.to_string(),
                            insight_type: "storage_forecast_critical".to_string(),
                            severity: Severity::Critical,
                            title: "Storage Capacity Critical".to_string(),
                            description: format!(
                                "Storage will be full in approximately {:.1} days at current growth rate",
                                days_until_full
                            ),
                            category: Some("storage".to_string()),
                            confidence: Some(0.7),
                            metadata: json!({
                                "days_until_full": days_until_full,
                                "growth_rate_gb_per_day": gb_per_day,
                            }),
                        });
                    } else if days_until_full < config::storage_forecast_warning_days() {
                        insights.push(InsightRecord {
                            timestamp: now,
                            node_name: node_name.to_string(),
                            insight_type: "storage_forecast_warning".to_string(),
                            severity: Severity::Warning,
                            title: "Storage Capacity Warning".to_string(),
                            description: format!(
                                "Storage will be full in approximately {:.1} days at current growth rate",
                                days_until_full
                            ),
                            category: Some("storage".to_string()),
                            confidence: Some(0.6),
                            metadata: json!({
                                "days_until_full": days_until_full,
                                "growth_rate_gb_per_day": gb_per_day,
                            }),
                        });
                    }
                }
            }
        }

        insights
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline(mean: f64, std_dev: f64) -> BaselineStats {
        BaselineStats {
            mean,
            std_dev,
            min: mean - 2.0 * std_dev,
            max: mean + 2.0 * std_dev,
            count: 100,
        }
    }

    #[test]
    fn test_z_score() {
        let b = baseline(100.0, 10.0);
        assert!((AnalyticsEngine::calculate_z_score(135.0, &b).unwrap() - 3.5).abs() < 1e-9);
        assert!((AnalyticsEngine::calculate_z_score(65.0, &b).unwrap() + 3.5).abs() < 1e-9);
    }

    #[test]
    fn test_z_score_undefined_for_zero_deviation() {
        let b = baseline(100.0, 0.0);
        assert!(AnalyticsEngine::calculate_z_score(150.0, &b).is_none());
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_eq!(AnalyticsEngine::calculate_percentile(&values, 0.0), Some(1.0));
        assert_eq!(AnalyticsEngine::calculate_percentile(&values, 100.0), Some(4.0));
        assert_eq!(AnalyticsEngine::calculate_percentile(&values, 50.0), Some(2.5));
        assert_eq!(AnalyticsEngine::calculate_percentile(&[], 50.0), None);
    }

    #[test]
    fn test_percentile_monotonic() {
        let values = [5.0, 1.0, 9.0, 3.0, 7.0, 2.0];
        let mut last = f64::NEG_INFINITY;
        for p in [0.0, 10.0, 25.0, 50.0, 75.0, 90.0, 99.0, 100.0] {
            let v = AnalyticsEngine::calculate_percentile(&values, p).unwrap();
            assert!(v >= last, "percentile({}) = {} < {}", p, v, last);
            last = v;
        }
    }

    #[test]
    fn test_trend_detection() {
        let rising: Vec<f64> = (0..10).map(|i| 100.0 + i as f64 * 10.0).collect();
        assert_eq!(AnalyticsEngine::detect_trend(&rising, 0.1).0, "increasing");

        let falling: Vec<f64> = (0..10).map(|i| 100.0 - i as f64 * 10.0).collect();
        assert_eq!(AnalyticsEngine::detect_trend(&falling, 0.1).0, "decreasing");

        let flat = vec![100.0; 10];
        assert_eq!(AnalyticsEngine::detect_trend(&flat, 0.1).0, "stable");

        assert_eq!(AnalyticsEngine::detect_trend(&[1.0, 2.0], 0.1).0, "stable");
    }

    #[test]
    fn test_rate_of_change() {
        let base = Utc::now() - Duration::hours(10);
        let series = vec![
            (base, 100.0),
            (base + Duration::hours(5), 150.0),
            (base + Duration::hours(10), 200.0),
        ];
        let rate = AnalyticsEngine::calculate_rate_of_change(&series, 24).unwrap();
        assert!((rate - 10.0).abs() < 1e-6);

        assert!(AnalyticsEngine::calculate_rate_of_change(&series[..1], 24).is_none());
    }

    #[test]
    fn test_reputation_health_insights() {
        let engine_less_rows = vec![json!({
            "satellite": "sat-1",
            "audit_score": 65.0,
            "suspension_score": 100.0,
            "online_score": 99.9,
        })];
        // Static analysis without a DB handle is exercised through the
        // free-standing threshold logic; build a throwaway engine.
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let (ctx, _crx) = tokio::sync::mpsc::channel(1);
        let handle = crate::db_writer::DbHandle::for_tests("unused.db", tx, ctx);
        let engine = AnalyticsEngine::new(handle);

        let insights = engine.analyze_reputation_health("n", &engine_less_rows);
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].insight_type, "reputation_critical");
        assert_eq!(insights[0].severity, Severity::Critical);
    }
}
