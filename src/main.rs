use clap::Parser;

use nodepulse::types::MonitorError;
use nodepulse::{config, db, ingest, server, telemetry};

/// Operational monitor for a fleet of decentralized storage nodes
#[derive(Parser, Debug)]
#[command(name = "nodepulse", version, about)]
struct Args {
    /// SERVER MODE: node descriptor 'NodeName:/path/to/log' or
    /// 'NodeName:host:port'. Repeatable.
    #[arg(long = "node", conflicts_with = "ingest_log")]
    nodes: Vec<String>,

    /// INGEST MODE: ingest a log file for one node and exit.
    /// Format: 'NodeName:/path/to/log'
    #[arg(long = "ingest-log")]
    ingest_log: Option<String>,

    /// Management API base URL for a node: 'NodeName:http://host:port'.
    /// Repeatable.
    #[arg(long = "api-url")]
    api_urls: Vec<String>,

    /// Configuration file path
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let mut telemetry_config = telemetry::TelemetryConfig::default();
    if args.debug {
        telemetry_config.log_level = "debug".to_string();
    }
    telemetry::init_tracing(telemetry_config)?;

    config::init_global_config(&args.config)?;
    tracing::debug!(
        file = args.config.as_str(),
        initialized = config::is_initialized(),
        "configuration loaded"
    );
    let db_path = config::database_file();
    db::init_db(&db_path)?;

    if let Some(descriptor) = args.ingest_log {
        let (node_name, log_path) = descriptor.split_once(':').ok_or_else(|| {
            MonitorError::new(format!(
                "Invalid format for --ingest-log: '{}'. Expected 'NodeName:/path/to/log.log'.",
                descriptor
            ))
        })?;
        if node_name.is_empty() || log_path.is_empty() {
            return Err(
                MonitorError::new(format!("Invalid format for --ingest-log: '{}'", descriptor))
                    .into(),
            );
        }
        let node_name = node_name.to_string();
        let log_path = log_path.to_string();
        tokio::task::spawn_blocking(move || {
            ingest::run_bulk_ingest(&node_name, &log_path, &db_path)
        })
        .await??;
        return Ok(());
    }

    let nodes = config::parse_node_descriptors(&args.nodes, &args.api_urls)?;
    server::run_server(nodes).await?;
    Ok(())
}
