/// Telemetry Module - Structured Logging with Tracing
///
/// Provides:
/// - Structured logging with tracing
/// - JSON vs pretty format support
/// - File logging with daily rotation
/// - RUST_LOG env var support

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use tracing_appender::rolling;

/// Telemetry configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    pub log_level: String,
    /// Log format: "json" or "pretty"
    pub log_format: String,
    /// Optional log file path (None = console only)
    pub log_file: Option<String>,
    /// Rotation interval: "daily", "hourly", "never"
    pub rotation: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: std::env::var("NODEPULSE_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string()),
            log_file: std::env::var("NODEPULSE_LOG_FILE").ok(),
            rotation: "daily".to_string(),
        }
    }
}

/// Initialize tracing subscriber
///
/// Reads RUST_LOG (default: info), supports JSON vs pretty output and an
/// optional rotating log file.
pub fn init_tracing(config: TelemetryConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if let Some(log_file_path) = config.log_file {
        let path = std::path::Path::new(&log_file_path);
        let directory = path
            .parent()
            .ok_or("Invalid log file path: no parent directory")?;
        let filename_prefix = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or("Invalid log file path: no filename")?;

        let file_appender = match config.rotation.as_str() {
            "hourly" => rolling::hourly(directory, filename_prefix),
            "never" => rolling::never(
                directory,
                path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("nodepulse.log")),
            ),
            _ => rolling::daily(directory, filename_prefix),
        };

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if config.log_format == "json" {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_span_list(true)
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_thread_ids(false)
                        .with_writer(non_blocking),
                )
                .init();
        }

        // Keep guard alive (otherwise logs won't flush)
        std::mem::forget(guard);
    } else if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_current_span(true).with_span_list(true))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).with_thread_ids(false))
            .init();
    }

    Ok(())
}

/// Truncate an opaque identifier (piece ID, satellite ID) for logging
///
/// Example: "QmVeryLongPieceIdentifier" (max 8) -> "QmVeryLo..."
pub fn truncate_id(id: &str, len: usize) -> String {
    if id.len() <= len {
        id.to_string()
    } else {
        format!("{}...", &id[..len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_id() {
        assert_eq!(truncate_id("abcd", 16), "abcd");
        assert_eq!(truncate_id("0123456789abcdef0123", 16), "0123456789abcdef...");
        assert_eq!(truncate_id("", 16), "");
    }
}
