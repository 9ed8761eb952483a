/// Webhook Notification Sender
///
/// Discord-, Slack- and generic-JSON-shaped webhook payloads posted with a
/// shared HTTP client. Best-effort: failures are logged, never raised.

use serde_json::{json, Value};

/// Target webhook dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookPlatform {
    Discord,
    Slack,
    Custom,
}

/// Post one alert notification to a webhook URL.
pub async fn send_webhook_notification(
    client: &reqwest::Client,
    url: &str,
    platform: WebhookPlatform,
    alert_type: &str,
    severity: &str,
    message: &str,
    details: &Value,
) {
    if url.is_empty() {
        tracing::warn!("no webhook URL provided for {:?}, skipping", platform);
        return;
    }

    let payload = match platform {
        WebhookPlatform::Discord => format_discord(alert_type, severity, message, details),
        WebhookPlatform::Slack => format_slack(alert_type, severity, message, details),
        WebhookPlatform::Custom => format_custom(alert_type, severity, message, details),
    };

    match client.post(url).json(&payload).send().await {
        Ok(response) => {
            if response.status().is_success() {
                tracing::info!(
                    "sent {:?} webhook notification for {} ({})",
                    platform,
                    alert_type,
                    severity
                );
            } else {
                tracing::error!(
                    "webhook {:?} returned HTTP {} for {}",
                    platform,
                    response.status(),
                    alert_type
                );
            }
        }
        Err(e) => tracing::error!("failed to send {:?} webhook: {}", platform, e),
    }
}

fn details_fields(details: &Value, name_key: &str, value_key: &str, short_key: &str) -> Vec<Value> {
    details
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| {
                    let rendered = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    json!({name_key: k, value_key: rendered, short_key: true})
                })
                .collect()
        })
        .unwrap_or_default()
}

fn format_discord(alert_type: &str, severity: &str, message: &str, details: &Value) -> Value {
    let color = match severity.to_uppercase().as_str() {
        "CRITICAL" => 16711680,
        "WARNING" => 16776960,
        "INFO" => 255,
        _ => 0,
    };
    json!({
        "username": "NodePulse",
        "embeds": [{
            "title": format!("Node Alert: {}", alert_type),
            "description": message,
            "color": color,
            "fields": details_fields(details, "name", "value", "inline"),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }]
    })
}

fn format_slack(alert_type: &str, severity: &str, message: &str, details: &Value) -> Value {
    let color = match severity.to_uppercase().as_str() {
        "CRITICAL" => "#FF0000",
        "WARNING" => "#FFA500",
        "INFO" => "#0000FF",
        _ => "#000000",
    };
    json!({
        "attachments": [{
            "fallback": format!("Node Alert: {} - {} - {}", alert_type, severity, message),
            "color": color,
            "pretext": format!("Node Alert: *{}*", severity.to_uppercase()),
            "title": alert_type,
            "text": message,
            "fields": details_fields(details, "title", "value", "short"),
            "ts": chrono::Utc::now().timestamp(),
        }]
    })
}

fn format_custom(alert_type: &str, severity: &str, message: &str, details: &Value) -> Value {
    json!({
        "alert_type": alert_type,
        "severity": severity,
        "message": message,
        "details": details,
        "timestamp": chrono::Utc::now().timestamp(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discord_payload_shape() {
        let payload = format_discord(
            "audit_score_critical",
            "critical",
            "Audit score is critically low.",
            &json!({"satellite": "us1", "score": 65.0}),
        );
        assert_eq!(payload["username"], "NodePulse");
        let embed = &payload["embeds"][0];
        assert_eq!(embed["color"], 16711680);
        assert_eq!(embed["fields"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_slack_payload_shape() {
        let payload = format_slack("uptime_warning", "warning", "msg", &json!({"a": 1}));
        let attachment = &payload["attachments"][0];
        assert_eq!(attachment["color"], "#FFA500");
        assert_eq!(attachment["title"], "uptime_warning");
        assert_eq!(attachment["fields"][0]["title"], "a");
    }

    #[test]
    fn test_custom_payload_carries_everything() {
        let details = json!({"node_name": "alpha"});
        let payload = format_custom("t", "info", "m", &details);
        assert_eq!(payload["alert_type"], "t");
        assert_eq!(payload["details"], details);
        assert!(payload["timestamp"].is_i64());
    }
}
