use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Boxed error type used across async task boundaries
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Production-ready error type with context
#[derive(Debug, Clone)]
pub struct MonitorError {
    pub message: String,
}

impl MonitorError {
    /// Create a new error
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for MonitorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MonitorError {}

/// Format a timestamp the way every persisted row stores it: RFC 3339,
/// microsecond precision, UTC designator. Lexicographic order on these
/// strings matches chronological order.
pub fn iso_micros(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Outcome of a piece-level operation as reported by the log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Failed,
    Canceled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Success => "success",
            EventStatus::Failed => "failed",
            EventStatus::Canceled => "canceled",
        }
    }

    pub fn from_db(s: &str) -> Self {
        match s {
            "success" => EventStatus::Success,
            "canceled" => EventStatus::Canceled,
            _ => EventStatus::Failed,
        }
    }
}

/// Derived operation class used by the stats engine and aggregation queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrafficCategory {
    Get,
    Put,
    Audit,
    GetRepair,
    PutRepair,
    Other,
}

impl TrafficCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficCategory::Get => "get",
            TrafficCategory::Put => "put",
            TrafficCategory::Audit => "audit",
            TrafficCategory::GetRepair => "get_repair",
            TrafficCategory::PutRepair => "put_repair",
            TrafficCategory::Other => "other",
        }
    }
}

/// Enriched remote location. All fields may be absent: a cache miss yields
/// country-only or fully empty locations and consumers must cope.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub country: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// Immutable record of one piece-level operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficEvent {
    pub timestamp: DateTime<Utc>,
    /// Unix seconds, fractional. Kept alongside the parsed timestamp so the
    /// hot stats paths never re-derive it.
    pub ts_unix: f64,
    pub action: String,
    pub status: EventStatus,
    pub size: i64,
    pub piece_id: Option<String>,
    pub satellite_id: String,
    pub remote_ip: Option<String>,
    pub location: Location,
    pub error_reason: Option<String>,
    pub node_name: String,
    pub duration_ms: Option<i64>,
    pub category: TrafficCategory,
}

/// Identity of one in-flight hashstore compaction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompactionKey {
    pub node_name: String,
    pub satellite: String,
    pub store: String,
}

/// Persisted record of a finished compaction run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionRecord {
    pub node_name: String,
    pub satellite: String,
    pub store: String,
    pub last_run_iso: String,
    pub duration: f64,
    pub data_reclaimed_bytes: i64,
    pub data_rewritten_bytes: i64,
    pub table_load: f64,
    pub trash_percent: f64,
}

/// One parsed log line. The parser emits exactly one variant per accepted
/// line and never pairs compaction begin/end itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ParsedLine {
    Traffic(TrafficEvent),
    CompactionBegin {
        key: CompactionKey,
        timestamp: DateTime<Utc>,
    },
    CompactionEnd {
        key: CompactionKey,
        timestamp: DateTime<Utc>,
        record: CompactionRecord,
    },
    /// A line that only reveals the node's remaining allocation; becomes a
    /// partial storage snapshot.
    StorageHint {
        timestamp: DateTime<Utc>,
        available_bytes: i64,
    },
}

/// Per-(node, satellite) reputation sample. Scores are percentages
/// (the management API's 0..1 values multiplied by 100).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationSample {
    pub timestamp: DateTime<Utc>,
    pub node_name: String,
    pub satellite: String,
    pub audit_score: Option<f64>,
    pub suspension_score: Option<f64>,
    pub online_score: Option<f64>,
    pub audit_success_count: i64,
    pub audit_total_count: i64,
    pub is_disqualified: bool,
    pub is_suspended: bool,
}

/// Disk capacity snapshot. Log-derived snapshots carry only
/// `available_bytes`; everything else is None.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub timestamp: DateTime<Utc>,
    pub node_name: String,
    pub total_bytes: Option<i64>,
    pub used_bytes: Option<i64>,
    pub available_bytes: Option<i64>,
    pub trash_bytes: Option<i64>,
    pub used_percent: Option<f64>,
    pub trash_percent: Option<f64>,
    pub available_percent: Option<f64>,
}

/// Alert severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An alert as generated by the alert manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub timestamp: DateTime<Utc>,
    pub node_name: String,
    pub alert_type: String,
    pub severity: Severity,
    pub title: String,
    pub message: String,
    pub metadata: serde_json::Value,
}

/// A persisted analytic finding, distinct from an alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InsightRecord {
    pub timestamp: DateTime<Utc>,
    pub node_name: String,
    pub insight_type: String,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub category: Option<String>,
    pub confidence: Option<f64>,
    pub metadata: serde_json::Value,
}

/// Statistical baseline for one (node, metric, window) triple
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineStats {
    pub mean: f64,
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
    pub count: i64,
}

/// Per-(node, satellite, period) earnings estimate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarningsEstimate {
    pub timestamp: DateTime<Utc>,
    pub node_name: String,
    pub satellite: String,
    /// `YYYY-MM`
    pub period: String,
    pub egress_bytes: i64,
    pub egress_earnings_gross: f64,
    pub egress_earnings_net: f64,
    pub storage_bytes_hour: i64,
    pub storage_earnings_gross: f64,
    pub storage_earnings_net: f64,
    pub repair_bytes: i64,
    pub repair_earnings_gross: f64,
    pub repair_earnings_net: f64,
    pub audit_bytes: i64,
    pub audit_earnings_gross: f64,
    pub audit_earnings_net: f64,
    pub total_earnings_gross: f64,
    pub total_earnings_net: f64,
    pub held_amount: f64,
    pub node_age_months: i64,
    pub held_percentage: f64,
    pub is_finalized: bool,
}

/// Where a node's log lines come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeSource {
    File { path: String },
    Network { host: String, port: u16 },
}

/// Operator-declared node: name, log source, optional management API
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub name: String,
    pub source: NodeSource,
    pub api_url: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_iso_micros_format() {
        let ts = Utc.with_ymd_and_hms(2025, 1, 8, 10, 0, 0).unwrap();
        assert_eq!(iso_micros(&ts), "2025-01-08T10:00:00.000000Z");
    }

    #[test]
    fn test_iso_micros_orders_lexicographically() {
        let a = Utc.with_ymd_and_hms(2025, 1, 8, 10, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2025, 1, 8, 10, 0, 1).unwrap();
        assert!(iso_micros(&a) < iso_micros(&b));
    }

    #[test]
    fn test_status_round_trip() {
        for s in [EventStatus::Success, EventStatus::Failed, EventStatus::Canceled] {
            assert_eq!(EventStatus::from_db(s.as_str()), s);
        }
    }

    #[test]
    fn test_severity_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Severity::Critical).unwrap(),
            "\"critical\""
        );
    }
}
