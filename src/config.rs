use config::Config;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::error::Error;

use crate::types::{NodeConfig, NodeSource};

static GLOBAL_CONFIG: OnceCell<Config> = OnceCell::new();

/// Well-known satellite IDs and their short names
pub fn satellite_names() -> &'static HashMap<&'static str, &'static str> {
    static NAMES: OnceCell<HashMap<&'static str, &'static str>> = OnceCell::new();
    NAMES.get_or_init(|| {
        let mut m = HashMap::new();
        m.insert("121RTSDpyNZVcEU84Ticf2L1ntiuUimbWgfATz21tuvgk3vzoA6", "ap1");
        m.insert("12EayRS2V1kEsWESU9QMRseFhdxYxKicsiFmxrsLZHeLUtdps3S", "us1");
        m.insert("12L9ZFwhzVpuEKMUNUqkaTLGzwY9G24tbiigLiXpmZWKwmcNDDs", "eu1");
        m.insert("1wFTAgs9DP5RSnCqKV1eLf6N9wtk4EAtmN5DpSxcs8EjT69tGE", "saltlake");
        m
    })
}

/// Short display name for a satellite ID
pub fn satellite_display_name(sat_id: &str) -> String {
    match satellite_names().get(sat_id) {
        Some(name) => (*name).to_string(),
        None => {
            if sat_id.len() > 12 {
                format!("{}...", &sat_id[..12])
            } else {
                sat_id.to_string()
            }
        }
    }
}

pub fn init_global_config(path: &str) -> Result<(), Box<dyn Error + Send + Sync>> {
    let config = Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(config::Environment::with_prefix("NODEPULSE"))
        .build()?;
    GLOBAL_CONFIG
        .set(config)
        .map_err(|_| "Config already set")?;
    Ok(())
}

/// Whether a configuration source has been loaded
pub fn is_initialized() -> bool {
    GLOBAL_CONFIG.get().is_some()
}

// Typed accessors fall back to the documented defaults when no config file
// was loaded, so library consumers and tests never require init.
fn get_str(key: &str, default: &str) -> String {
    GLOBAL_CONFIG
        .get()
        .and_then(|c| c.get_string(key).ok())
        .unwrap_or_else(|| default.to_string())
}

fn get_i64(key: &str, default: i64) -> i64 {
    GLOBAL_CONFIG
        .get()
        .and_then(|c| c.get_int(key).ok())
        .unwrap_or(default)
}

fn get_f64(key: &str, default: f64) -> f64 {
    GLOBAL_CONFIG
        .get()
        .and_then(|c| c.get_float(key).ok())
        .unwrap_or(default)
}

fn get_bool(key: &str, default: bool) -> bool {
    GLOBAL_CONFIG
        .get()
        .and_then(|c| c.get_bool(key).ok())
        .unwrap_or(default)
}

/// Embedded database path, `~` expanded
pub fn database_file() -> String {
    let raw = get_str("database.file", "nodepulse_stats.db");
    shellexpand::tilde(&raw).into_owned()
}

pub fn server_host() -> String {
    get_str("server.host", "0.0.0.0")
}

pub fn server_port() -> u16 {
    get_i64("server.port", 8765) as u16
}

pub fn stats_window_minutes() -> i64 {
    get_i64("stats.window_minutes", 60)
}

pub fn stats_interval_seconds() -> u64 {
    get_i64("stats.interval_seconds", 5) as u64
}

pub fn performance_interval_seconds() -> u64 {
    get_i64("stats.performance_interval_seconds", 2) as u64
}

pub fn websocket_batch_interval_ms() -> u64 {
    get_i64("websocket.batch_interval_ms", 25) as u64
}

pub fn websocket_batch_size() -> usize {
    get_i64("websocket.batch_size", 10) as usize
}

pub fn db_write_batch_interval_seconds() -> u64 {
    get_i64("database.write_batch_interval_seconds", 10) as u64
}

pub fn db_queue_max_size() -> usize {
    get_i64("database.queue_max_size", 30000) as usize
}

pub fn db_live_batch_size() -> usize {
    get_i64("database.live_batch_size", 1000) as usize
}

pub fn db_ingest_batch_size() -> usize {
    get_i64("database.ingest_batch_size", 50000) as usize
}

pub fn db_max_retries() -> u32 {
    get_i64("database.max_retries", 3) as u32
}

pub fn db_retry_base_delay_secs() -> f64 {
    get_f64("database.retry_base_delay", 0.5)
}

pub fn db_retry_max_delay_secs() -> f64 {
    get_f64("database.retry_max_delay", 5.0)
}

pub fn db_prune_interval_hours() -> u64 {
    get_i64("database.prune_interval_hours", 6) as u64
}

pub fn events_retention_days() -> i64 {
    get_i64("database.events_retention_days", 2)
}

pub fn hashstore_retention_days() -> i64 {
    get_i64("database.hashstore_retention_days", 180)
}

pub fn alerts_retention_days() -> i64 {
    get_i64("database.alerts_retention_days", 90)
}

pub fn insights_retention_days() -> i64 {
    get_i64("database.insights_retention_days", 90)
}

pub fn baselines_retention_days() -> i64 {
    get_i64("database.analytics_retention_days", 180)
}

pub fn earnings_retention_days() -> i64 {
    get_i64("database.earnings_retention_days", 365)
}

pub fn hourly_agg_interval_minutes() -> u64 {
    get_i64("database.hourly_agg_interval_minutes", 10) as u64
}

pub fn historical_hours_to_show() -> i64 {
    get_i64("stats.historical_hours_to_show", 6)
}

pub fn node_api_timeout_secs() -> u64 {
    get_i64("node_api.timeout_seconds", 10) as u64
}

pub fn node_api_poll_interval_secs() -> u64 {
    get_i64("node_api.poll_interval_seconds", 300) as u64
}

pub fn node_api_default_port() -> u16 {
    get_i64("node_api.default_port", 14002) as u16
}

pub fn geoip_cache_size() -> usize {
    get_i64("geoip.cache_size", 5000) as usize
}

pub fn geoip_database_path() -> String {
    let raw = get_str("geoip.database_path", "GeoLite2-City.mmdb");
    shellexpand::tilde(&raw).into_owned()
}

// --- Alert thresholds ---

pub fn audit_score_warning() -> f64 {
    get_f64("thresholds.audit_score_warning", 85.0)
}

pub fn audit_score_critical() -> f64 {
    get_f64("thresholds.audit_score_critical", 70.0)
}

pub fn suspension_score_critical() -> f64 {
    get_f64("thresholds.suspension_score_critical", 60.0)
}

pub fn online_score_warning() -> f64 {
    get_f64("thresholds.online_score_warning", 95.0)
}

pub fn storage_warning_percent() -> f64 {
    get_f64("thresholds.storage_warning_percent", 80.0)
}

pub fn storage_critical_percent() -> f64 {
    get_f64("thresholds.storage_critical_percent", 95.0)
}

pub fn storage_forecast_warning_days() -> f64 {
    get_f64("thresholds.storage_forecast_warning_days", 30.0)
}

pub fn storage_forecast_critical_days() -> f64 {
    get_f64("thresholds.storage_forecast_critical_days", 7.0)
}

pub fn latency_warning_ms() -> f64 {
    get_f64("thresholds.latency_warning_ms", 5000.0)
}

pub fn latency_critical_ms() -> f64 {
    get_f64("thresholds.latency_critical_ms", 10000.0)
}

// --- Anomaly detection / alerting cadence ---

pub fn enable_anomaly_detection() -> bool {
    get_bool("anomaly.enabled", true)
}

pub fn anomaly_zscore_threshold() -> f64 {
    get_f64("anomaly.zscore_threshold", 3.0)
}

pub fn alert_evaluation_interval_secs() -> u64 {
    get_i64("alerts.evaluation_interval_minutes", 5) as u64 * 60
}

pub fn alert_cooldown_minutes() -> i64 {
    get_i64("alerts.cooldown_minutes", 15)
}

// --- Financial tracking ---

pub fn enable_financial_tracking() -> bool {
    get_bool("financial.enabled", true)
}

pub fn pricing_egress_per_tb() -> f64 {
    get_f64("financial.pricing_egress_per_tb", 2.00)
}

pub fn pricing_storage_per_tb_month() -> f64 {
    get_f64("financial.pricing_storage_per_tb_month", 1.50)
}

pub fn pricing_repair_per_tb() -> f64 {
    get_f64("financial.pricing_repair_per_tb", 2.00)
}

pub fn pricing_audit_per_tb() -> f64 {
    get_f64("financial.pricing_audit_per_tb", 2.00)
}

// Listed prices are already net to the operator, hence the 1.0 defaults.
pub fn operator_share_egress() -> f64 {
    get_f64("financial.operator_share_egress", 1.0)
}

pub fn operator_share_storage() -> f64 {
    get_f64("financial.operator_share_storage", 1.0)
}

pub fn operator_share_repair() -> f64 {
    get_f64("financial.operator_share_repair", 1.0)
}

pub fn operator_share_audit() -> f64 {
    get_f64("financial.operator_share_audit", 1.0)
}

// --- Notifications ---

pub fn enable_email_notifications() -> bool {
    get_bool("notifications.email_enabled", false)
}

pub fn enable_webhook_notifications() -> bool {
    get_bool("notifications.webhook_enabled", false)
}

pub fn email_smtp_server() -> String {
    get_str("notifications.email_smtp_server", "")
}

pub fn email_smtp_port() -> u16 {
    get_i64("notifications.email_smtp_port", 587) as u16
}

pub fn email_use_tls() -> bool {
    get_bool("notifications.email_use_tls", true)
}

pub fn email_username() -> String {
    get_str("notifications.email_username", "")
}

pub fn email_password() -> String {
    get_str("notifications.email_password", "")
}

pub fn email_to_addresses() -> Vec<String> {
    let raw = get_str("notifications.email_to", "");
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

pub fn webhook_discord_url() -> Option<String> {
    let url = get_str("notifications.webhook_discord_url", "");
    if url.is_empty() {
        None
    } else {
        Some(url)
    }
}

pub fn webhook_slack_url() -> Option<String> {
    let url = get_str("notifications.webhook_slack_url", "");
    if url.is_empty() {
        None
    } else {
        Some(url)
    }
}

pub fn webhook_custom_urls() -> Vec<String> {
    let raw = get_str("notifications.webhook_custom_urls", "");
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `NAME:/path/to/log` or `NAME:host:port` node descriptors.
///
/// If the source path exists on disk it is a file. Otherwise, when the tail
/// looks like `host:port` it is a network forwarder; anything else is kept
/// as a file path that does not exist yet.
pub fn parse_node_descriptors(
    args: &[String],
    api_urls: &[String],
) -> Result<Vec<NodeConfig>, Box<dyn Error + Send + Sync>> {
    if args.is_empty() {
        return Err("No nodes specified. Use --node 'NodeName:/path/to/log' or 'NodeName:host:port'.".into());
    }

    let mut api_map: HashMap<String, String> = HashMap::new();
    for entry in api_urls {
        let (name, url) = entry
            .split_once(':')
            .ok_or_else(|| format!("Invalid api-url format: '{}'. Expected 'NodeName:URL'.", entry))?;
        api_map.insert(name.to_string(), url.to_string());
    }

    let mut nodes = Vec::new();
    for arg in args {
        let (name, source) = arg.split_once(':').ok_or_else(|| {
            format!(
                "Invalid node format: '{}'. Expected 'NodeName:/path/to/log' or 'NodeName:host:port'.",
                arg
            )
        })?;
        if name.is_empty() || source.is_empty() {
            return Err(format!("Invalid node format: '{}'", arg).into());
        }

        let source = if std::path::Path::new(source).exists() {
            tracing::info!(node = name, path = source, "configured node with file source");
            NodeSource::File {
                path: source.to_string(),
            }
        } else if let Some((host, port_str)) = source.rsplit_once(':') {
            match port_str.parse::<u16>() {
                Ok(port) if port >= 1 && !host.is_empty() => {
                    tracing::info!(node = name, host, port, "configured node with network source");
                    NodeSource::Network {
                        host: host.to_string(),
                        port,
                    }
                }
                _ => {
                    tracing::warn!(node = name, path = source, "configured node with file source (path does not exist yet)");
                    NodeSource::File {
                        path: source.to_string(),
                    }
                }
            }
        } else {
            tracing::warn!(node = name, path = source, "configured node with file source (path does not exist yet)");
            NodeSource::File {
                path: source.to_string(),
            }
        };

        nodes.push(NodeConfig {
            name: name.to_string(),
            source,
            api_url: api_map.remove(name),
        });
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_network_descriptor() {
        let nodes =
            parse_node_descriptors(&["alpha:10.0.0.5:9000".to_string()], &[]).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, "alpha");
        assert_eq!(
            nodes[0].source,
            NodeSource::Network {
                host: "10.0.0.5".to_string(),
                port: 9000
            }
        );
    }

    #[test]
    fn test_parse_missing_file_falls_back_to_file_source() {
        let nodes =
            parse_node_descriptors(&["beta:/no/such/log/file.log".to_string()], &[]).unwrap();
        assert_eq!(
            nodes[0].source,
            NodeSource::File {
                path: "/no/such/log/file.log".to_string()
            }
        );
    }

    #[test]
    fn test_parse_rejects_empty() {
        assert!(parse_node_descriptors(&[], &[]).is_err());
        assert!(parse_node_descriptors(&["nameonly".to_string()], &[]).is_err());
    }

    #[test]
    fn test_api_url_attaches_to_node() {
        let nodes = parse_node_descriptors(
            &["alpha:10.0.0.5:9000".to_string()],
            &["alpha:http://localhost:14002".to_string()],
        )
        .unwrap();
        assert_eq!(nodes[0].api_url.as_deref(), Some("http://localhost:14002"));
    }

    #[test]
    fn test_satellite_display_name() {
        assert_eq!(
            satellite_display_name("12EayRS2V1kEsWESU9QMRseFhdxYxKicsiFmxrsLZHeLUtdps3S"),
            "us1"
        );
        assert_eq!(
            satellite_display_name("1234567890abcdefgh"),
            "1234567890ab..."
        );
        assert_eq!(satellite_display_name("short"), "short");
    }
}
