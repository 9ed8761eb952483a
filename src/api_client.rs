/// Node Management API Client
///
/// Thin HTTP client for a storage daemon's management port: dashboard,
/// per-satellite detail, and estimated payout. Transient failures are
/// swallowed for the current poll cycle; permanent 4xx responses disable
/// the endpoint for the rest of the session.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config;
use crate::metrics;

/// Permanent endpoint failures are re-logged at most this often
const PERMANENT_LOG_INTERVAL_SECS: i64 = 3600;

pub struct NodeApiClient {
    pub node_name: String,
    base_url: String,
    http: reqwest::Client,
    available: AtomicBool,
    disabled_endpoints: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl NodeApiClient {
    pub fn new(node_name: &str, base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config::node_api_timeout_secs()))
            .build()
            .unwrap_or_default();
        Self {
            node_name: node_name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
            available: AtomicBool::new(false),
            disabled_endpoints: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    /// Probe the dashboard endpoint once at startup.
    pub async fn probe(&self) -> bool {
        let available = self.get_json("/api/sno/").await.is_some();
        self.available.store(available, Ordering::Relaxed);
        if available {
            tracing::info!(
                node = self.node_name.as_str(),
                url = self.base_url.as_str(),
                "management API is reachable"
            );
        } else {
            tracing::warn!(
                node = self.node_name.as_str(),
                url = self.base_url.as_str(),
                "management API is not reachable, API-backed features disabled"
            );
        }
        available
    }

    async fn endpoint_disabled(&self, path: &str) -> bool {
        self.disabled_endpoints.lock().await.contains_key(path)
    }

    async fn disable_endpoint(&self, path: &str, status: StatusCode) {
        let mut disabled = self.disabled_endpoints.lock().await;
        let now = Utc::now();
        let should_log = disabled
            .get(path)
            .map(|last| (now - *last).num_seconds() >= PERMANENT_LOG_INTERVAL_SECS)
            .unwrap_or(true);
        if should_log {
            tracing::warn!(
                node = self.node_name.as_str(),
                endpoint = path,
                "management API returned permanent error {}, disabling endpoint for this session",
                status
            );
        }
        disabled.insert(path.to_string(), now);
    }

    async fn get_json(&self, path: &str) -> Option<Value> {
        if self.endpoint_disabled(path).await {
            return None;
        }
        let url = format!("{}{}", self.base_url, path);
        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                metrics::API_POLL_ERRORS.with_label_values(&[path]).inc();
                tracing::debug!(
                    node = self.node_name.as_str(),
                    "API request to {} failed: {}",
                    url,
                    e
                );
                return None;
            }
        };

        let status = response.status();
        if status.is_success() {
            return response.json::<Value>().await.ok();
        }
        metrics::API_POLL_ERRORS.with_label_values(&[path]).inc();
        if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
            self.disable_endpoint(path, status).await;
        } else {
            // 5xx and 429 are transient; the next poll cycle retries
            tracing::debug!(
                node = self.node_name.as_str(),
                "API request to {} returned {}",
                url,
                status
            );
        }
        None
    }

    /// Dashboard summary: disk space, started-at, versions.
    pub async fn get_dashboard(&self) -> Option<Value> {
        self.get_json("/api/sno/").await
    }

    /// Per-satellite details including reputation scores.
    pub async fn get_satellites(&self) -> Option<Value> {
        self.get_json("/api/sno/satellites").await
    }

    /// Estimated payout for the current and previous months.
    pub async fn get_estimated_payout(&self) -> Option<Value> {
        self.get_json("/api/sno/estimated-payout").await
    }
}

/// Build API clients for every node that declared a management URL.
pub async fn build_api_clients(
    nodes: &[crate::types::NodeConfig],
) -> HashMap<String, std::sync::Arc<NodeApiClient>> {
    let mut clients = HashMap::new();
    for node in nodes {
        if let Some(api_url) = &node.api_url {
            let client = std::sync::Arc::new(NodeApiClient::new(&node.name, api_url));
            client.probe().await;
            clients.insert(node.name.clone(), client);
        }
    }
    clients
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unreachable_api_is_unavailable() {
        let client = NodeApiClient::new("n", "http://127.0.0.1:1");
        assert!(!client.probe().await);
        assert!(!client.is_available());
        assert!(client.get_dashboard().await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_endpoint_short_circuits() {
        let client = NodeApiClient::new("n", "http://127.0.0.1:1");
        client
            .disable_endpoint("/api/sno/satellites", StatusCode::NOT_FOUND)
            .await;
        assert!(client.endpoint_disabled("/api/sno/satellites").await);
        assert!(client.get_satellites().await.is_none());
        assert!(!client.endpoint_disabled("/api/sno/").await);
    }

    #[test]
    fn test_base_url_trailing_slash_normalized() {
        let client = NodeApiClient::new("n", "http://localhost:14002/");
        assert_eq!(client.base_url, "http://localhost:14002");
    }
}
