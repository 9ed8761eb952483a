/// Incremental Statistics Engine
///
/// Maintains a running summary of the events in the live window for each
/// client-selected view and produces complete wire payloads on demand.
/// `add_event` is O(1) average; error templating is O(len(reason)) with a
/// bounded per-reason template cache.

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config;
use crate::parser::{get_size_bucket, size_bucket_labels};
use crate::types::{iso_micros, EventStatus, TrafficCategory, TrafficEvent};

/// Bound on distinct cached reason strings
const TEMPLATE_CACHE_LIMIT: usize = 1000;
/// Bound on distinct addresses remembered per placeholder
const ADDRESS_SEEN_LIMIT: usize = 100;
const TOP_N: usize = 10;

lazy_static! {
    /// IPv4 (optionally with :port) or bare integers, collapsed to '#'
    static ref TOKEN_REGEX: Regex =
        Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}(?::\d+)?\b|\b\d+\b").unwrap();
}

/// Canonical cache key for a view selection
pub fn view_key(view: &[String]) -> String {
    let mut names: Vec<&str> = view.iter().map(|s| s.as_str()).collect();
    names.sort_unstable();
    names.join(",")
}

#[derive(Debug, Default, Clone)]
struct SatelliteStats {
    uploads: u64,
    downloads: u64,
    audits: u64,
    ul_success: u64,
    dl_success: u64,
    audit_success: u64,
    total_upload_size: i64,
    total_download_size: i64,
}

#[derive(Debug, Clone)]
enum Placeholder {
    Address { seen: HashSet<String> },
    Number { min: i64, max: i64 },
    Text { seen: HashSet<String> },
}

#[derive(Debug, Clone)]
struct ErrorAggregate {
    count: u64,
    placeholders: Vec<Placeholder>,
}

/// Running statistics for one view
#[derive(Default)]
pub struct IncrementalStats {
    pub dl_success: u64,
    pub dl_fail: u64,
    pub ul_success: u64,
    pub ul_fail: u64,
    pub audit_success: u64,
    pub audit_fail: u64,
    pub total_dl_size: i64,
    pub total_ul_size: i64,

    pub live_dl_bytes: i64,
    pub live_ul_bytes: i64,

    satellites: HashMap<String, SatelliteStats>,
    countries_dl: HashMap<String, i64>,
    countries_ul: HashMap<String, i64>,

    dls_success: HashMap<&'static str, u64>,
    dls_failed: HashMap<&'static str, u64>,
    uls_success: HashMap<&'static str, u64>,
    uls_failed: HashMap<&'static str, u64>,

    error_agg: HashMap<String, ErrorAggregate>,
    error_templates_cache: HashMap<String, (String, Vec<String>)>,

    hot_pieces: HashMap<String, (u64, i64)>,

    /// Per-node ring sequence high-water marks for incremental catch-up
    pub last_processed: HashMap<String, u64>,
}

impl IncrementalStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn satellite_mut(&mut self, sat_id: &str) -> &mut SatelliteStats {
        self.satellites.entry(sat_id.to_string()).or_default()
    }

    /// Fold one event into the running counters.
    pub fn add_event(&mut self, event: &TrafficEvent) {
        let is_success = event.status == EventStatus::Success;
        let size = event.size;

        match event.category {
            TrafficCategory::Audit => {
                self.satellite_mut(&event.satellite_id).audits += 1;
                if is_success {
                    self.audit_success += 1;
                    self.satellite_mut(&event.satellite_id).audit_success += 1;
                } else {
                    self.audit_fail += 1;
                    if let Some(reason) = &event.error_reason {
                        self.aggregate_error(reason);
                    }
                }
            }
            TrafficCategory::Get => {
                self.satellite_mut(&event.satellite_id).downloads += 1;

                if let Some(piece_id) = &event.piece_id {
                    let entry = self.hot_pieces.entry(piece_id.clone()).or_insert((0, 0));
                    entry.0 += 1;
                    entry.1 += size;
                }

                if let Some(country) = &event.location.country {
                    *self.countries_dl.entry(country.clone()).or_insert(0) += size;
                }

                let bucket = get_size_bucket(size);
                if is_success {
                    self.dl_success += 1;
                    let sat = self.satellite_mut(&event.satellite_id);
                    sat.dl_success += 1;
                    sat.total_download_size += size;
                    self.total_dl_size += size;
                    *self.dls_success.entry(bucket).or_insert(0) += 1;
                } else {
                    self.dl_fail += 1;
                    if let Some(reason) = &event.error_reason {
                        self.aggregate_error(reason);
                    }
                    *self.dls_failed.entry(bucket).or_insert(0) += 1;
                }
            }
            TrafficCategory::Put => {
                self.satellite_mut(&event.satellite_id).uploads += 1;

                if let Some(country) = &event.location.country {
                    *self.countries_ul.entry(country.clone()).or_insert(0) += size;
                }

                let bucket = get_size_bucket(size);
                if is_success {
                    self.ul_success += 1;
                    let sat = self.satellite_mut(&event.satellite_id);
                    sat.ul_success += 1;
                    sat.total_upload_size += size;
                    self.total_ul_size += size;
                    *self.uls_success.entry(bucket).or_insert(0) += 1;
                } else {
                    self.ul_fail += 1;
                    if let Some(reason) = &event.error_reason {
                        self.aggregate_error(reason);
                    }
                    *self.uls_failed.entry(bucket).or_insert(0) += 1;
                }
            }
            // Repair traffic and unknown actions are persisted and appear in
            // hourly aggregates; the live overview only tracks get/put/audit.
            _ => {}
        }
    }

    fn tokenize(&mut self, reason: &str) -> (String, Vec<String>) {
        if let Some(cached) = self.error_templates_cache.get(reason) {
            return cached.clone();
        }

        let mut tokens = Vec::new();
        let mut template = String::with_capacity(reason.len());
        let mut last_end = 0;
        for m in TOKEN_REGEX.find_iter(reason) {
            template.push_str(&reason[last_end..m.start()]);
            template.push('#');
            tokens.push(m.as_str().to_string());
            last_end = m.end();
        }
        template.push_str(&reason[last_end..]);

        if self.error_templates_cache.len() < TEMPLATE_CACHE_LIMIT {
            self.error_templates_cache
                .insert(reason.to_string(), (template.clone(), tokens.clone()));
        }
        (template, tokens)
    }

    fn aggregate_error(&mut self, reason: &str) {
        if reason.is_empty() {
            return;
        }
        let (template, tokens) = self.tokenize(reason);

        match self.error_agg.get_mut(&template) {
            None => {
                let placeholders = tokens
                    .iter()
                    .map(|token| {
                        if token.contains('.') || token.contains(':') {
                            let mut seen = HashSet::new();
                            seen.insert(token.clone());
                            Placeholder::Address { seen }
                        } else if let Ok(num) = token.parse::<i64>() {
                            Placeholder::Number { min: num, max: num }
                        } else {
                            let mut seen = HashSet::new();
                            seen.insert(token.clone());
                            Placeholder::Text { seen }
                        }
                    })
                    .collect();
                self.error_agg.insert(
                    template,
                    ErrorAggregate {
                        count: 1,
                        placeholders,
                    },
                );
            }
            Some(agg) => {
                agg.count += 1;
                if tokens.len() == agg.placeholders.len() {
                    for (token, ph) in tokens.iter().zip(agg.placeholders.iter_mut()) {
                        match ph {
                            Placeholder::Address { seen } => {
                                if seen.len() < ADDRESS_SEEN_LIMIT {
                                    seen.insert(token.clone());
                                }
                            }
                            Placeholder::Number { min, max } => {
                                if let Ok(num) = token.parse::<i64>() {
                                    if num < *min {
                                        *min = num;
                                    } else if num > *max {
                                        *max = num;
                                    }
                                }
                            }
                            Placeholder::Text { seen } => {
                                if seen.len() < ADDRESS_SEEN_LIMIT {
                                    seen.insert(token.clone());
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    /// Recompute last-minute byte totals by scanning only recent events.
    pub fn update_live_stats(&mut self, events: &[Arc<TrafficEvent>]) {
        let one_min_ago = chrono::Utc::now().timestamp_micros() as f64 / 1e6 - 60.0;
        self.live_dl_bytes = 0;
        self.live_ul_bytes = 0;
        for event in events {
            if event.ts_unix > one_min_ago && event.status == EventStatus::Success {
                match event.category {
                    TrafficCategory::Get => self.live_dl_bytes += event.size,
                    TrafficCategory::Put => self.live_ul_bytes += event.size,
                    _ => {}
                }
            }
        }
    }

    fn render_errors(&self) -> Vec<Value> {
        let mut sorted: Vec<(&String, &ErrorAggregate)> = self.error_agg.iter().collect();
        sorted.sort_by(|a, b| b.1.count.cmp(&a.1.count).then_with(|| a.0.cmp(b.0)));

        sorted
            .into_iter()
            .take(TOP_N)
            .map(|(template, agg)| {
                let mut message = template.clone();
                for ph in &agg.placeholders {
                    let replacement = match ph {
                        Placeholder::Number { min, max } => {
                            if min == max {
                                min.to_string()
                            } else {
                                format!("({}..{})", min, max)
                            }
                        }
                        Placeholder::Address { seen } => {
                            let count = seen.len();
                            format!(
                                "[{} unique address{}]",
                                count,
                                if count > 1 { "es" } else { "" }
                            )
                        }
                        Placeholder::Text { .. } => continue,
                    };
                    message = message.replacen('#', &replacement, 1);
                }
                json!({"reason": message, "count": agg.count})
            })
            .collect()
    }

    fn top_counter(counter: &HashMap<String, i64>) -> Vec<Value> {
        let mut entries: Vec<(&String, &i64)> =
            counter.iter().filter(|(k, _)| !k.is_empty()).collect();
        entries.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        entries
            .into_iter()
            .take(TOP_N)
            .map(|(country, size)| json!({"country": country, "size": size}))
            .collect()
    }

    /// Produce the `stats_update` frame. The time range is the sliding
    /// wall-clock window, not the extent of tracked events.
    pub fn to_payload(&self, historical_stats: Vec<Value>) -> Value {
        let last_event_ts = chrono::Utc::now();
        let first_event_ts =
            last_event_ts - chrono::Duration::minutes(config::stats_window_minutes());

        let avg_egress_mbps = (self.live_dl_bytes as f64 * 8.0) / (60.0 * 1e6);
        let avg_ingress_mbps = (self.live_ul_bytes as f64 * 8.0) / (60.0 * 1e6);

        let mut satellites: Vec<(&String, &SatelliteStats)> = self.satellites.iter().collect();
        satellites.sort_by(|a, b| {
            (b.1.uploads + b.1.downloads)
                .cmp(&(a.1.uploads + a.1.downloads))
                .then_with(|| a.0.cmp(b.0))
        });
        let satellites: Vec<Value> = satellites
            .into_iter()
            .map(|(id, s)| {
                json!({
                    "satellite_id": id,
                    "uploads": s.uploads,
                    "downloads": s.downloads,
                    "audits": s.audits,
                    "ul_success": s.ul_success,
                    "dl_success": s.dl_success,
                    "audit_success": s.audit_success,
                    "total_upload_size": s.total_upload_size,
                    "total_download_size": s.total_download_size,
                })
            })
            .collect();

        let transfer_sizes: Vec<Value> = size_bucket_labels()
            .iter()
            .map(|bucket| {
                json!({
                    "bucket": bucket,
                    "downloads_success": self.dls_success.get(bucket).copied().unwrap_or(0),
                    "downloads_failed": self.dls_failed.get(bucket).copied().unwrap_or(0),
                    "uploads_success": self.uls_success.get(bucket).copied().unwrap_or(0),
                    "uploads_failed": self.uls_failed.get(bucket).copied().unwrap_or(0),
                })
            })
            .collect();

        let mut pieces: Vec<(&String, &(u64, i64))> = self.hot_pieces.iter().collect();
        pieces.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then_with(|| a.0.cmp(b.0)));
        let top_pieces: Vec<Value> = pieces
            .into_iter()
            .take(TOP_N)
            .map(|(id, (count, size))| json!({"id": id, "count": count, "size": size}))
            .collect();

        json!({
            "type": "stats_update",
            "first_event_iso": iso_micros(&first_event_ts),
            "last_event_iso": iso_micros(&last_event_ts),
            "overall": {
                "dl_success": self.dl_success,
                "dl_fail": self.dl_fail,
                "ul_success": self.ul_success,
                "ul_fail": self.ul_fail,
                "audit_success": self.audit_success,
                "audit_fail": self.audit_fail,
                "avg_egress_mbps": avg_egress_mbps,
                "avg_ingress_mbps": avg_ingress_mbps,
            },
            "satellites": satellites,
            "transfer_sizes": transfer_sizes,
            "historical_stats": historical_stats,
            "error_categories": self.render_errors(),
            "top_pieces": top_pieces,
            "top_countries_dl": Self::top_counter(&self.countries_dl),
            "top_countries_ul": Self::top_counter(&self.countries_ul),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Location;
    use chrono::Utc;

    fn event(
        category: TrafficCategory,
        status: EventStatus,
        size: i64,
        error: Option<&str>,
    ) -> TrafficEvent {
        let ts = Utc::now();
        TrafficEvent {
            timestamp: ts,
            ts_unix: ts.timestamp_micros() as f64 / 1e6,
            action: "GET".to_string(),
            status,
            size,
            piece_id: Some("piece-1".to_string()),
            satellite_id: "sat-1".to_string(),
            remote_ip: Some("192.168.1.1".to_string()),
            location: Location {
                country: Some("US".to_string()),
                lat: None,
                lon: None,
            },
            error_reason: error.map(|s| s.to_string()),
            node_name: "n".to_string(),
            duration_ms: None,
            category,
        }
    }

    #[test]
    fn test_counters_by_category() {
        let mut stats = IncrementalStats::new();
        stats.add_event(&event(TrafficCategory::Get, EventStatus::Success, 2048, None));
        stats.add_event(&event(TrafficCategory::Get, EventStatus::Failed, 100, Some("timed out")));
        stats.add_event(&event(TrafficCategory::Put, EventStatus::Success, 4096, None));
        stats.add_event(&event(TrafficCategory::Audit, EventStatus::Success, 0, None));

        assert_eq!(stats.dl_success, 1);
        assert_eq!(stats.dl_fail, 1);
        assert_eq!(stats.ul_success, 1);
        assert_eq!(stats.audit_success, 1);
        assert_eq!(stats.total_dl_size, 2048);
        assert_eq!(stats.total_ul_size, 4096);
    }

    #[test]
    fn test_repair_traffic_not_in_overview() {
        let mut stats = IncrementalStats::new();
        stats.add_event(&event(TrafficCategory::GetRepair, EventStatus::Success, 1024, None));
        assert_eq!(stats.dl_success, 0);
        assert_eq!(stats.total_dl_size, 0);
    }

    #[test]
    fn test_error_template_collapses_addresses_and_numbers() {
        let mut stats = IncrementalStats::new();
        stats.add_event(&event(
            TrafficCategory::Get,
            EventStatus::Failed,
            0,
            Some("write tcp 10.0.0.1:7777: timeout after 30 seconds"),
        ));
        stats.add_event(&event(
            TrafficCategory::Get,
            EventStatus::Failed,
            0,
            Some("write tcp 10.0.0.2:8888: timeout after 45 seconds"),
        ));

        assert_eq!(stats.error_agg.len(), 1);
        let errors = stats.render_errors();
        assert_eq!(errors.len(), 1);
        let reason = errors[0]["reason"].as_str().unwrap();
        assert!(reason.contains("[2 unique addresses]"), "got: {}", reason);
        assert!(reason.contains("(30..45)"), "got: {}", reason);
        assert_eq!(errors[0]["count"], 2);
    }

    #[test]
    fn test_error_template_single_number_rendered_plain() {
        let mut stats = IncrementalStats::new();
        stats.add_event(&event(
            TrafficCategory::Get,
            EventStatus::Failed,
            0,
            Some("piece expired 42 hours ago"),
        ));
        let errors = stats.render_errors();
        assert_eq!(errors[0]["reason"].as_str().unwrap(), "piece expired 42 hours ago");
    }

    #[test]
    fn test_template_cache_is_bounded() {
        let mut stats = IncrementalStats::new();
        for i in 0..(TEMPLATE_CACHE_LIMIT + 500) {
            stats.aggregate_error(&format!("unique failure kind {} of piece x{}", i, i));
        }
        assert!(stats.error_templates_cache.len() <= TEMPLATE_CACHE_LIMIT);
    }

    #[test]
    fn test_live_stats_only_last_minute() {
        let mut stats = IncrementalStats::new();
        let mut old = event(TrafficCategory::Get, EventStatus::Success, 1000, None);
        old.ts_unix -= 120.0;
        let recent = event(TrafficCategory::Put, EventStatus::Success, 500, None);
        stats.update_live_stats(&[Arc::new(old), Arc::new(recent)]);
        assert_eq!(stats.live_dl_bytes, 0);
        assert_eq!(stats.live_ul_bytes, 500);
    }

    #[test]
    fn test_payload_shape() {
        let mut stats = IncrementalStats::new();
        stats.add_event(&event(TrafficCategory::Get, EventStatus::Success, 2048, None));
        let payload = stats.to_payload(vec![]);
        assert_eq!(payload["type"], "stats_update");
        assert_eq!(payload["overall"]["dl_success"], 1);
        assert_eq!(payload["transfer_sizes"].as_array().unwrap().len(), 7);
        assert_eq!(payload["top_countries_dl"][0]["country"], "US");
        assert_eq!(payload["top_pieces"][0]["id"], "piece-1");
    }

    #[test]
    fn test_view_key_is_order_insensitive() {
        let a = view_key(&["b".to_string(), "a".to_string()]);
        let b = view_key(&["a".to_string(), "b".to_string()]);
        assert_eq!(a, b);
        assert_eq!(view_key(&["Aggregate".to_string()]), "Aggregate");
    }
}
