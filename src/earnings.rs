/// Financial Tracker
///
/// Per-satellite earnings estimates: traffic classes priced per TB,
/// storage priced by GB-hour trapezoidal integration of snapshots, held
/// amount by node-age schedule, and month-end forecasts with a confidence
/// score. API payout data is preferred for satellite discovery; the
/// database is the fallback.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

use crate::api_client::NodeApiClient;
use crate::config;
use crate::db;
use crate::db_writer::{DbCommand, DbHandle};
use crate::types::{iso_micros, EarningsEstimate};
use crate::websocket::WsHub;

const TB: f64 = 1024.0 * 1024.0 * 1024.0 * 1024.0;
const GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// `YYYY-MM` for a timestamp
pub fn period_of(ts: &DateTime<Utc>) -> String {
    format!("{:04}-{:02}", ts.year(), ts.month())
}

/// The `YYYY-MM` period immediately before the given one
pub fn previous_period(period: &str) -> Option<String> {
    let (start, _end) = period_range(period)?;
    let prev_end = start - Duration::days(1);
    Some(period_of(&prev_end))
}

/// Half-open UTC range `[start, end)` for a `YYYY-MM` period
pub fn period_range(period: &str) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    let (year_str, month_str) = period.split_once('-')?;
    let year: i32 = year_str.parse().ok()?;
    let month: u32 = month_str.parse().ok()?;
    if !(1..=12).contains(&month) {
        return None;
    }
    let start = Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0).single()?;
    let end = if month == 12 {
        Utc.with_ymd_and_hms(year + 1, 1, 1, 0, 0, 0).single()?
    } else {
        Utc.with_ymd_and_hms(year, month + 1, 1, 0, 0, 0).single()?
    };
    Some((start, end))
}

/// Held fraction of gross earnings by node age in months
pub fn calculate_held_percentage(node_age_months: i64) -> f64 {
    if node_age_months <= 3 {
        0.75
    } else if node_age_months <= 6 {
        0.50
    } else if node_age_months <= 9 {
        0.25
    } else {
        0.00
    }
}

/// Byte-hours of stored data over the period via the trapezoidal rule.
/// The last sample is extended flat to the period end.
pub fn integrate_byte_hours(
    samples: &[(DateTime<Utc>, i64)],
    period_end: DateTime<Utc>,
) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut total = 0.0;
    for pair in samples.windows(2) {
        let (t1, b1) = pair[0];
        let (t2, b2) = pair[1];
        let hours = (t2 - t1).num_seconds() as f64 / 3600.0;
        total += (b1 as f64 + b2 as f64) / 2.0 * hours;
    }
    let (last_time, last_bytes) = samples[samples.len() - 1];
    if last_time < period_end {
        let hours = (period_end - last_time).num_seconds() as f64 / 3600.0;
        total += last_bytes as f64 * hours;
    }
    total
}

/// Per-class traffic earnings for one (node, satellite, period)
#[derive(Debug, Default, Clone)]
pub struct TrafficEarnings {
    pub egress_bytes: i64,
    pub egress_gross: f64,
    pub egress_net: f64,
    pub repair_bytes: i64,
    pub repair_gross: f64,
    pub repair_net: f64,
    pub audit_bytes: i64,
    pub audit_gross: f64,
    pub audit_net: f64,
}

pub struct FinancialTracker {
    pub node_name: String,
    api_client: Option<Arc<NodeApiClient>>,
}

impl FinancialTracker {
    pub fn new(node_name: &str, api_client: Option<Arc<NodeApiClient>>) -> Self {
        Self {
            node_name: node_name.to_string(),
            api_client,
        }
    }

    async fn get_api_earnings(&self) -> Option<Value> {
        let client = self.api_client.as_ref()?;
        if !client.is_available() {
            return None;
        }
        client.get_estimated_payout().await
    }

    /// Traffic earnings from persisted events for a period.
    pub async fn calculate_from_traffic(
        &self,
        db_path: &str,
        satellite: &str,
        period: &str,
    ) -> TrafficEarnings {
        let Some((start, end)) = period_range(period) else {
            return TrafficEarnings::default();
        };
        let path = db_path.to_string();
        let node = self.node_name.clone();
        let sat = satellite.to_string();
        let start_iso = iso_micros(&start);
        let end_iso = iso_micros(&end);
        let sums = tokio::task::spawn_blocking(move || {
            db::traffic_byte_sums(&path, &node, &sat, &start_iso, &end_iso)
        })
        .await
        .ok()
        .and_then(|r| r.ok());

        let Some((egress_bytes, repair_bytes, audit_bytes)) = sums else {
            return TrafficEarnings::default();
        };

        let egress_gross = egress_bytes as f64 / TB * config::pricing_egress_per_tb();
        let repair_gross = repair_bytes as f64 / TB * config::pricing_repair_per_tb();
        let audit_gross = audit_bytes as f64 / TB * config::pricing_audit_per_tb();

        TrafficEarnings {
            egress_bytes,
            egress_gross,
            egress_net: egress_gross * config::operator_share_egress(),
            repair_bytes,
            repair_gross,
            repair_net: repair_gross * config::operator_share_repair(),
            audit_bytes,
            audit_gross,
            audit_net: audit_gross * config::operator_share_audit(),
        }
    }

    /// Storage earnings via the GB-hour method. Returns
    /// (byte_hours, gross, net).
    pub async fn calculate_storage_earnings(
        &self,
        db_path: &str,
        period: &str,
    ) -> (i64, f64, f64) {
        let Some((start, end)) = period_range(period) else {
            return (0, 0.0, 0.0);
        };
        let path = db_path.to_string();
        let node = self.node_name.clone();
        let start_iso = iso_micros(&start);
        let end_iso = iso_micros(&end);
        let samples = tokio::task::spawn_blocking(move || {
            db::storage_samples_for_period(&path, &node, &start_iso, &end_iso)
        })
        .await
        .ok()
        .and_then(|r| r.ok())
        .unwrap_or_default();

        if samples.is_empty() {
            tracing::warn!(
                node = self.node_name.as_str(),
                period,
                "no storage snapshots found for period"
            );
            return (0, 0.0, 0.0);
        }

        let byte_hours = integrate_byte_hours(&samples, end);
        let gb_hours = byte_hours / GB;
        let days_in_month = (end - start).num_days() as f64;
        let hours_in_month = days_in_month * 24.0;
        let tb_months = gb_hours / (1024.0 * hours_in_month);

        let gross = tb_months * config::pricing_storage_per_tb_month();
        let net = gross * config::operator_share_storage();
        (byte_hours as i64, gross, net)
    }

    /// Node age in months: API start date when reachable, otherwise the
    /// earliest persisted activity. Unknown ages default to 16+ (no held).
    pub async fn determine_node_age(&self, db_path: &str) -> i64 {
        if let Some(client) = &self.api_client {
            if client.is_available() {
                if let Some(dashboard) = client.get_dashboard().await {
                    if let Some(started) = dashboard["startedAt"].as_str() {
                        if let Ok(started) = DateTime::parse_from_rfc3339(started) {
                            let started = started.with_timezone(&Utc);
                            let now = Utc::now();
                            let months = (now.year() - started.year()) as i64 * 12
                                + now.month() as i64
                                - started.month() as i64;
                            return months.max(1);
                        }
                    }
                }
            }
        }

        let path = db_path.to_string();
        let node = self.node_name.clone();
        let earliest = tokio::task::spawn_blocking(move || {
            db::earliest_node_activity(&path, &node)
        })
        .await
        .ok()
        .and_then(|r| r.ok())
        .flatten();

        match earliest {
            Some(started) => {
                let now = Utc::now();
                let months = (now.year() - started.year()) as i64 * 12 + now.month() as i64
                    - started.month() as i64;
                months.max(1)
            }
            None => {
                tracing::warn!(
                    node = self.node_name.as_str(),
                    "could not determine node age, defaulting to 16+ months"
                );
                16
            }
        }
    }

    /// Earnings estimates for every satellite the node serves in a period.
    pub async fn calculate_monthly_earnings(
        &self,
        db_path: &str,
        period: &str,
    ) -> Vec<EarningsEstimate> {
        let api_data = self.get_api_earnings().await;
        let node_age_months = self.determine_node_age(db_path).await;
        let held_percentage = calculate_held_percentage(node_age_months);
        let current_period = period_of(&Utc::now());

        // Satellite discovery: API payout data first, events table fallback
        let mut satellites: Vec<String> = api_data
            .as_ref()
            .and_then(|d| d["currentMonth"].as_object())
            .map(|m| m.keys().filter(|k| *k != "total").cloned().collect())
            .unwrap_or_default();
        if satellites.is_empty() {
            let path = db_path.to_string();
            let node = self.node_name.clone();
            satellites = tokio::task::spawn_blocking(move || {
                db::distinct_satellites(&path, &node)
            })
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();
        }

        let mut estimates = Vec::new();
        for satellite in satellites {
            let traffic = self.calculate_from_traffic(db_path, &satellite, period).await;
            let (storage_bytes_hour, storage_gross, storage_net) =
                self.calculate_storage_earnings(db_path, period).await;

            let total_gross =
                traffic.egress_gross + traffic.repair_gross + traffic.audit_gross + storage_gross;
            let total_net =
                traffic.egress_net + traffic.repair_net + traffic.audit_net + storage_net;
            let held_amount = total_gross * held_percentage;

            estimates.push(EarningsEstimate {
                timestamp: Utc::now(),
                node_name: self.node_name.clone(),
                satellite,
                period: period.to_string(),
                egress_bytes: traffic.egress_bytes,
                egress_earnings_gross: traffic.egress_gross,
                egress_earnings_net: traffic.egress_net,
                storage_bytes_hour,
                storage_earnings_gross: storage_gross,
                storage_earnings_net: storage_net,
                repair_bytes: traffic.repair_bytes,
                repair_earnings_gross: traffic.repair_gross,
                repair_earnings_net: traffic.repair_net,
                audit_bytes: traffic.audit_bytes,
                audit_earnings_gross: traffic.audit_gross,
                audit_earnings_net: traffic.audit_net,
                total_earnings_gross: total_gross,
                total_earnings_net: total_net,
                held_amount,
                node_age_months,
                held_percentage,
                is_finalized: period < current_period.as_str(),
            });
        }
        estimates
    }

    /// Month-end payout forecast with a confidence score. The current
    /// month extrapolates linearly by elapsed-day fraction.
    pub async fn forecast_payout(&self, db_path: &str, period: &str) -> Value {
        let estimates = self.calculate_monthly_earnings(db_path, period).await;
        if estimates.is_empty() {
            return json!({
                "period": period,
                "forecasted_payout": 0.0,
                "confidence": 0.0,
                "reason": "No data available",
            });
        }

        let total_net: f64 = estimates.iter().map(|e| e.total_earnings_net).sum();
        let total_held: f64 = estimates.iter().map(|e| e.held_amount).sum();

        let now = Utc::now();
        let current_period = period_of(&now);
        let (time_confidence, forecasted) = if period == current_period {
            let (start, end) = match period_range(period) {
                Some(range) => range,
                None => return json!({"period": period, "forecasted_payout": 0.0, "confidence": 0.0}),
            };
            let days_in_month = (end - start).num_days() as f64;
            let progress = (now.day() as f64 / days_in_month).min(1.0);
            let extrapolated = total_net / progress.max(0.01);
            (0.5 + 0.5 * progress, extrapolated)
        } else if period.to_string() < current_period {
            (1.0, total_net)
        } else {
            (0.3, total_net)
        };

        let has_storage_data = estimates.iter().any(|e| e.storage_bytes_hour > 0);
        let data_confidence = if has_storage_data { 1.0 } else { 0.7 };
        let confidence = time_confidence * data_confidence;

        json!({
            "period": period,
            "forecasted_payout": forecasted,
            "forecasted_payout_before_held": forecasted + total_held,
            "held_amount": total_held,
            "confidence": confidence,
            "time_confidence": time_confidence,
            "data_confidence": data_confidence,
            "satellites": estimates.len(),
        })
    }

    /// Calculate and persist the current month's estimates.
    pub async fn track_earnings(&self, db_handle: &DbHandle) {
        let period = period_of(&Utc::now());
        let estimates = self
            .calculate_monthly_earnings(&db_handle.db_path, &period)
            .await;
        if estimates.is_empty() {
            tracing::warn!(node = self.node_name.as_str(), "no earnings estimates calculated");
            return;
        }
        for estimate in estimates {
            let sat_name = config::satellite_display_name(&estimate.satellite);
            tracing::info!(
                node = self.node_name.as_str(),
                satellite = sat_name.as_str(),
                "earnings estimate: ${:.4} net (${:.4} held)",
                estimate.total_earnings_net,
                estimate.held_amount
            );
            db_handle.send(DbCommand::Earnings(estimate)).await;
        }
    }
}

/// Format persisted estimates for the wire, with forecasts attached.
pub async fn earnings_rows_payload(
    trackers: &HashMap<String, Arc<FinancialTracker>>,
    db_path: &str,
    rows: Vec<Value>,
    period: &str,
    include_forecast: bool,
) -> Vec<Value> {
    let round2 = |v: f64| (v * 100.0).round() / 100.0;
    let mut formatted = Vec::new();
    for estimate in rows {
        let node_name = estimate["node_name"].as_str().unwrap_or("").to_string();
        let forecast = if include_forecast {
            match trackers.get(&node_name) {
                Some(tracker) => Some(tracker.forecast_payout(db_path, period).await),
                None => None,
            }
        } else {
            None
        };

        let satellite = estimate["satellite"].as_str().unwrap_or("");
        formatted.push(json!({
            "node_name": node_name,
            "satellite": config::satellite_display_name(satellite),
            "period": estimate["period"],
            "total_net": round2(estimate["total_earnings_net"].as_f64().unwrap_or(0.0)),
            "total_gross": round2(estimate["total_earnings_gross"].as_f64().unwrap_or(0.0)),
            "held_amount": round2(estimate["held_amount"].as_f64().unwrap_or(0.0)),
            "breakdown": {
                "egress": round2(estimate["egress_earnings_net"].as_f64().unwrap_or(0.0)),
                "storage": round2(estimate["storage_earnings_net"].as_f64().unwrap_or(0.0)),
                "repair": round2(estimate["repair_earnings_net"].as_f64().unwrap_or(0.0)),
                "audit": round2(estimate["audit_earnings_net"].as_f64().unwrap_or(0.0)),
            },
            "forecast_month_end": forecast.as_ref().map(|f| round2(f["forecasted_payout"].as_f64().unwrap_or(0.0))),
            "confidence": forecast.as_ref().map(|f| round2(f["confidence"].as_f64().unwrap_or(0.0))),
            "is_finalized": estimate["is_finalized"],
        }));
    }
    formatted
}

/// Periodic earnings poller plus broadcast of fresh estimates.
pub fn spawn_earnings_poller(
    trackers: HashMap<String, Arc<FinancialTracker>>,
    db_handle: DbHandle,
    hub: Arc<WsHub>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        if !config::enable_financial_tracking() {
            tracing::info!("financial tracking is disabled in configuration");
            return;
        }
        tracing::info!("financial tracking polling task started");
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

            for tracker in trackers.values() {
                tracker.track_earnings(&db_handle).await;
            }

            // Broadcast the refreshed current-month estimates
            let period = period_of(&Utc::now());
            let node_names: Vec<String> = trackers.keys().cloned().collect();
            let db_path = db_handle.db_path.clone();
            let query_period = period.clone();
            let rows = tokio::task::spawn_blocking(move || {
                db::get_earnings_estimates(&db_path, &node_names, Some(&query_period), 30)
            })
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default();

            if !rows.is_empty() {
                let formatted =
                    earnings_rows_payload(&trackers, &db_handle.db_path, rows, &period, true).await;
                hub.broadcast(&json!({"type": "earnings_data", "data": formatted}), None)
                    .await;
            }
        }
        tracing::info!("financial polling task cancelled");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_held_percentage_schedule() {
        let cases = [
            (1, 0.75),
            (3, 0.75),
            (4, 0.50),
            (6, 0.50),
            (7, 0.25),
            (9, 0.25),
            (10, 0.00),
            (15, 0.00),
            (16, 0.00),
            (48, 0.00),
        ];
        for (months, expected) in cases {
            assert_eq!(
                calculate_held_percentage(months),
                expected,
                "month {}",
                months
            );
        }
    }

    #[test]
    fn test_period_range() {
        let (start, end) = period_range("2025-01").unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap());

        let (start, end) = period_range("2024-12").unwrap();
        assert_eq!(start.year(), 2024);
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());

        assert!(period_range("garbage").is_none());
        assert!(period_range("2025-13").is_none());
    }

    #[test]
    fn test_previous_period() {
        assert_eq!(previous_period("2025-01").unwrap(), "2024-12");
        assert_eq!(previous_period("2025-03").unwrap(), "2025-02");
    }

    #[test]
    fn test_trapezoidal_integration() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 4, 0, 0).unwrap();
        // 2 hours at average (100+200)/2, then 2 hours flat at 200
        let samples = vec![(start, 100), (start + Duration::hours(2), 200)];
        let byte_hours = integrate_byte_hours(&samples, end);
        assert!((byte_hours - (150.0 * 2.0 + 200.0 * 2.0)).abs() < 1e-6);
    }

    #[test]
    fn test_integration_invariant_under_subdivision() {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap();
        // Linear growth 0 -> 1000 over 10 hours
        let coarse = vec![(start, 0), (start + Duration::hours(10), 1000)];
        let fine: Vec<(DateTime<Utc>, i64)> = (0..=10)
            .map(|h| (start + Duration::hours(h), h * 100))
            .collect();
        let coarse_total = integrate_byte_hours(&coarse, end);
        let fine_total = integrate_byte_hours(&fine, end);
        assert!(
            (coarse_total - fine_total).abs() < 1e-6,
            "trapezoid must be invariant under subdivision: {} vs {}",
            coarse_total,
            fine_total
        );
    }

    #[test]
    fn test_integration_empty_samples() {
        let end = Utc::now();
        assert_eq!(integrate_byte_hours(&[], end), 0.0);
    }
}
