/// Log Line Parser
///
/// Turns one raw daemon log line into exactly one typed `ParsedLine`
/// variant, or drops it. Parsing never aborts the stream: callers count
/// rejected lines and move on.
///
/// Input contract (tab separated):
///   timestamp \t LEVEL \t SOURCE \t STATUS \t JSON_PAYLOAD

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::geoip::GeoIpService;
use crate::types::{
    CompactionKey, CompactionRecord, EventStatus, Location, ParsedLine, TrafficCategory,
    TrafficEvent,
};

const SIZE_BUCKETS: [&str; 7] = [
    "< 1 KB",
    "1-4 KB",
    "4-16 KB",
    "16-64 KB",
    "64-256 KB",
    "256 KB - 1 MB",
    "> 1 MB",
];

/// All histogram bucket labels, smallest first
pub fn size_bucket_labels() -> &'static [&'static str] {
    &SIZE_BUCKETS
}

/// Histogram bucket for a transfer size in bytes
pub fn get_size_bucket(size: i64) -> &'static str {
    if size < 1024 {
        SIZE_BUCKETS[0]
    } else if size < 4 * 1024 {
        SIZE_BUCKETS[1]
    } else if size < 16 * 1024 {
        SIZE_BUCKETS[2]
    } else if size < 64 * 1024 {
        SIZE_BUCKETS[3]
    } else if size < 256 * 1024 {
        SIZE_BUCKETS[4]
    } else if size < 1024 * 1024 {
        SIZE_BUCKETS[5]
    } else {
        SIZE_BUCKETS[6]
    }
}

/// Operation class for an action string. Unknown actions keep their raw
/// string on the event and fall into `Other`.
pub fn categorize_action(action: &str) -> TrafficCategory {
    match action {
        "GET_AUDIT" => TrafficCategory::Audit,
        "GET_REPAIR" => TrafficCategory::GetRepair,
        "PUT_REPAIR" => TrafficCategory::PutRepair,
        _ => {
            if action.starts_with("GET") {
                TrafficCategory::Get
            } else if action.starts_with("PUT") {
                TrafficCategory::Put
            } else {
                TrafficCategory::Other
            }
        }
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a Go-style duration string ("1m2.3s", "450ms", "2.5s") to
/// milliseconds. Plain numbers are taken as milliseconds already.
pub fn parse_duration_ms(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_f64().map(|v| v.round() as i64),
        Value::String(s) => parse_go_duration_ms(s),
        _ => None,
    }
}

fn parse_go_duration_ms(s: &str) -> Option<i64> {
    let mut total_ms = 0.0f64;
    let mut num = String::new();
    let mut chars = s.chars().peekable();
    let mut matched = false;

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() || c == '.' || c == '-' {
            num.push(c);
            continue;
        }
        let mut unit = String::from(c);
        while let Some(&next) = chars.peek() {
            if next.is_ascii_digit() || next == '.' || next == '-' {
                break;
            }
            unit.push(next);
            chars.next();
        }
        let value: f64 = num.parse().ok()?;
        num.clear();
        let factor = match unit.as_str() {
            "h" => 3_600_000.0,
            "m" => 60_000.0,
            "s" => 1_000.0,
            "ms" => 1.0,
            "us" | "\u{b5}s" | "\u{3bc}s" => 0.001,
            "ns" => 0.000_001,
            _ => return None,
        };
        total_ms += value * factor;
        matched = true;
    }

    if !num.is_empty() {
        // Bare trailing number with no unit
        let value: f64 = num.parse().ok()?;
        total_ms += value;
        matched = true;
    }
    if matched {
        Some(total_ms.round() as i64)
    } else {
        None
    }
}

fn payload_str(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(|v| v.as_str()).map(|s| s.to_string())
}

fn payload_i64(payload: &Value, key: &str) -> i64 {
    payload.get(key).and_then(|v| v.as_i64()).unwrap_or(0)
}

fn payload_f64(payload: &Value, key: &str) -> f64 {
    payload.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

fn traffic_status(status_text: &str) -> Option<EventStatus> {
    let lowered = status_text.to_ascii_lowercase();
    if lowered.contains("failed") {
        Some(EventStatus::Failed)
    } else if lowered.contains("cancel") {
        Some(EventStatus::Canceled)
    } else if lowered == "downloaded" || lowered == "uploaded" {
        Some(EventStatus::Success)
    } else {
        // "download started", "upload started" and friends carry no outcome
        None
    }
}

fn parse_compaction(
    node_name: &str,
    status_text: &str,
    timestamp: DateTime<Utc>,
    payload: &Value,
) -> Option<ParsedLine> {
    let satellite = payload_str(payload, "Satellite ID").unwrap_or_default();
    let store = payload_str(payload, "Store").unwrap_or_default();
    let key = CompactionKey {
        node_name: node_name.to_string(),
        satellite,
        store,
    };

    if status_text.contains("beginning compaction") || status_text.contains("compaction started") {
        return Some(ParsedLine::CompactionBegin { key, timestamp });
    }

    if status_text.contains("finished compaction") || status_text.contains("compaction completed") {
        let declared_duration = payload
            .get("Duration")
            .and_then(parse_duration_ms)
            .map(|ms| ms as f64 / 1000.0)
            .unwrap_or(0.0);
        let record = CompactionRecord {
            node_name: key.node_name.clone(),
            satellite: key.satellite.clone(),
            store: key.store.clone(),
            last_run_iso: crate::types::iso_micros(&timestamp),
            duration: declared_duration,
            data_reclaimed_bytes: payload_i64(payload, "Data Reclaimed"),
            data_rewritten_bytes: payload_i64(payload, "Data Rewritten"),
            table_load: payload_f64(payload, "Table Load"),
            trash_percent: payload_f64(payload, "Trash Percent"),
        };
        return Some(ParsedLine::CompactionEnd {
            key,
            timestamp,
            record,
        });
    }

    None
}

/// Parse one log line for the given node. Returns None for anything that is
/// not a complete traffic or compaction record.
pub fn parse_log_line(
    line: &str,
    node_name: &str,
    geoip: Option<&GeoIpService>,
) -> Option<ParsedLine> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return None;
    }

    let parts: Vec<&str> = trimmed.splitn(5, '\t').collect();
    if parts.len() < 5 {
        return None;
    }

    let timestamp = parse_timestamp(parts[0])?;
    let source = parts[2];
    let status_text = parts[3];
    let payload: Value = serde_json::from_str(parts[4]).ok()?;

    if source.contains("hashstore") {
        return parse_compaction(node_name, status_text, timestamp, &payload);
    }

    let status = match traffic_status(status_text) {
        Some(status) => status,
        None => {
            // Lines with no operation outcome can still reveal the node's
            // remaining allocation ("download started" carries it).
            if let Some(available) = payload.get("Available Space").and_then(|v| v.as_i64()) {
                return Some(ParsedLine::StorageHint {
                    timestamp,
                    available_bytes: available,
                });
            }
            return None;
        }
    };
    let action = payload_str(&payload, "Action").unwrap_or_else(|| "N/A".to_string());
    let category = categorize_action(&action);
    let size = payload.get("Size").and_then(|v| v.as_i64()).unwrap_or(0).max(0);
    let piece_id = payload_str(&payload, "Piece ID");
    let satellite_id = payload_str(&payload, "Satellite ID").unwrap_or_default();
    let remote_addr = payload_str(&payload, "Remote Address");
    let error_reason = payload_str(&payload, "error");
    let duration_ms = payload
        .get("Duration")
        .or_else(|| payload.get("duration"))
        .and_then(parse_duration_ms);

    let (remote_ip, location) = match remote_addr {
        Some(addr) => {
            let ip = GeoIpService::ip_of(&addr).to_string();
            let location = geoip.map(|g| g.lookup(&addr)).unwrap_or_default();
            (Some(ip), location)
        }
        None => (None, Location::default()),
    };

    Some(ParsedLine::Traffic(TrafficEvent {
        ts_unix: timestamp.timestamp_micros() as f64 / 1_000_000.0,
        timestamp,
        action,
        status,
        size,
        piece_id,
        satellite_id,
        remote_ip,
        location,
        error_reason,
        node_name: node_name.to_string(),
        duration_ms,
        category,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOWNLOAD_LINE: &str = "2025-01-08T10:00:00.123Z\tINFO\tpiecestore\tdownloaded\t{\"Piece ID\":\"P\",\"Satellite ID\":\"S\",\"Action\":\"GET\",\"Size\":1024000,\"Remote Address\":\"192.168.1.1:1234\"}";

    #[test]
    fn test_parse_download_line() {
        let parsed = parse_log_line(DOWNLOAD_LINE, "node-a", None).expect("line should parse");
        match parsed {
            ParsedLine::Traffic(ev) => {
                assert_eq!(ev.category, TrafficCategory::Get);
                assert_eq!(ev.status, EventStatus::Success);
                assert_eq!(ev.size, 1024000);
                assert_eq!(ev.satellite_id, "S");
                assert_eq!(ev.piece_id.as_deref(), Some("P"));
                assert_eq!(ev.remote_ip.as_deref(), Some("192.168.1.1"));
                assert_eq!(ev.node_name, "node-a");
            }
            other => panic!("expected traffic event, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_is_deterministic() {
        let a = parse_log_line(DOWNLOAD_LINE, "node-a", None).unwrap();
        let b = parse_log_line(DOWNLOAD_LINE, "node-a", None).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }

    #[test]
    fn test_parse_serialize_round_trip() {
        let a = parse_log_line(DOWNLOAD_LINE, "node-a", None).unwrap();
        let json = serde_json::to_string(&a).unwrap();
        let back: ParsedLine = serde_json::from_str(&json).unwrap();
        assert_eq!(
            serde_json::to_string(&back).unwrap(),
            json
        );
    }

    #[test]
    fn test_reject_short_and_malformed_lines() {
        assert!(parse_log_line("not a log line", "n", None).is_none());
        assert!(parse_log_line("a\tb\tc\td", "n", None).is_none());
        assert!(parse_log_line(
            "2025-01-08T10:00:00.123Z\tINFO\tpiecestore\tdownloaded\tnot-json",
            "n",
            None
        )
        .is_none());
        assert!(parse_log_line("", "n", None).is_none());
    }

    #[test]
    fn test_started_lines_are_dropped() {
        let line = "2025-01-08T10:00:00.123Z\tINFO\tpiecestore\tdownload started\t{\"Action\":\"GET\"}";
        assert!(parse_log_line(line, "n", None).is_none());
    }

    #[test]
    fn test_started_line_with_available_space_is_a_storage_hint() {
        let line = "2025-01-08T10:00:00.123Z\tINFO\tpiecestore\tupload started\t{\"Action\":\"PUT\",\"Available Space\":5000000000}";
        match parse_log_line(line, "n", None).unwrap() {
            ParsedLine::StorageHint { available_bytes, .. } => {
                assert_eq!(available_bytes, 5_000_000_000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failed_and_canceled_statuses() {
        let failed = "2025-01-08T10:00:00.123Z\tERROR\tpiecestore\tdownload failed\t{\"Action\":\"GET\",\"Satellite ID\":\"S\",\"Size\":10,\"error\":\"write tcp 10.0.0.1:7777: broken pipe\"}";
        match parse_log_line(failed, "n", None).unwrap() {
            ParsedLine::Traffic(ev) => {
                assert_eq!(ev.status, EventStatus::Failed);
                assert!(ev.error_reason.unwrap().contains("broken pipe"));
            }
            other => panic!("unexpected {:?}", other),
        }

        let canceled = "2025-01-08T10:00:00.123Z\tINFO\tpiecestore\tupload canceled\t{\"Action\":\"PUT\",\"Satellite ID\":\"S\",\"Size\":0}";
        match parse_log_line(canceled, "n", None).unwrap() {
            ParsedLine::Traffic(ev) => assert_eq!(ev.status, EventStatus::Canceled),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_categorized_as_other() {
        let line = "2025-01-08T10:00:00.123Z\tINFO\tpiecestore\tdownloaded\t{\"Action\":\"EXISTS\",\"Satellite ID\":\"S\",\"Size\":1}";
        match parse_log_line(line, "n", None).unwrap() {
            ParsedLine::Traffic(ev) => {
                assert_eq!(ev.action, "EXISTS");
                assert_eq!(ev.category, TrafficCategory::Other);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_categorize_action() {
        assert_eq!(categorize_action("GET"), TrafficCategory::Get);
        assert_eq!(categorize_action("GET_AUDIT"), TrafficCategory::Audit);
        assert_eq!(categorize_action("GET_REPAIR"), TrafficCategory::GetRepair);
        assert_eq!(categorize_action("PUT"), TrafficCategory::Put);
        assert_eq!(categorize_action("PUT_REPAIR"), TrafficCategory::PutRepair);
        assert_eq!(categorize_action("DELETE"), TrafficCategory::Other);
    }

    #[test]
    fn test_size_buckets() {
        assert_eq!(get_size_bucket(0), "< 1 KB");
        assert_eq!(get_size_bucket(1023), "< 1 KB");
        assert_eq!(get_size_bucket(1024), "1-4 KB");
        assert_eq!(get_size_bucket(5 * 1024), "4-16 KB");
        assert_eq!(get_size_bucket(20 * 1024), "16-64 KB");
        assert_eq!(get_size_bucket(100 * 1024), "64-256 KB");
        assert_eq!(get_size_bucket(600 * 1024), "256 KB - 1 MB");
        assert_eq!(get_size_bucket(5 * 1024 * 1024), "> 1 MB");
    }

    #[test]
    fn test_parse_go_duration() {
        assert_eq!(parse_go_duration_ms("2.5s"), Some(2500));
        assert_eq!(parse_go_duration_ms("450ms"), Some(450));
        assert_eq!(parse_go_duration_ms("1m2.3s"), Some(62300));
        assert_eq!(parse_go_duration_ms("1h"), Some(3_600_000));
        assert_eq!(parse_go_duration_ms("bogus"), None);
    }

    #[test]
    fn test_parse_compaction_pair() {
        let begin = "2025-01-08T10:00:00.000Z\tINFO\thashstore\tbeginning compaction\t{\"Satellite ID\":\"S1\",\"Store\":\"s0\"}";
        match parse_log_line(begin, "n", None).unwrap() {
            ParsedLine::CompactionBegin { key, .. } => {
                assert_eq!(key.satellite, "S1");
                assert_eq!(key.store, "s0");
                assert_eq!(key.node_name, "n");
            }
            other => panic!("unexpected {:?}", other),
        }

        let end = "2025-01-08T10:05:00.000Z\tINFO\thashstore\tfinished compaction\t{\"Satellite ID\":\"S1\",\"Store\":\"s0\",\"Duration\":\"5m\",\"Data Reclaimed\":1048576,\"Data Rewritten\":2048,\"Table Load\":0.42,\"Trash Percent\":3.5}";
        match parse_log_line(end, "n", None).unwrap() {
            ParsedLine::CompactionEnd { record, .. } => {
                assert_eq!(record.duration, 300.0);
                assert_eq!(record.data_reclaimed_bytes, 1048576);
                assert_eq!(record.data_rewritten_bytes, 2048);
                assert!((record.table_load - 0.42).abs() < 1e-9);
                assert!((record.trash_percent - 3.5).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
