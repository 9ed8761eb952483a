/// Notification Dispatch
///
/// Fans an alert out to every enabled channel (email, Discord/Slack/custom
/// webhooks). Non-blocking from the caller's perspective and never raises
/// into the alert manager: each channel handles its own failures.

use serde_json::Value;

use crate::config;
use crate::email;
use crate::webhooks::{send_webhook_notification, WebhookPlatform};

pub struct NotificationHandler {
    http: reqwest::Client,
}

impl NotificationHandler {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    /// Best-effort dispatch of one alert to every configured channel.
    pub async fn send_notification(
        &self,
        alert_type: &str,
        severity: &str,
        message: &str,
        details: &Value,
    ) {
        tracing::info!(
            "dispatching notification: {} - {} - {}",
            alert_type,
            severity,
            message
        );

        let email_enabled =
            config::enable_email_notifications() && !config::email_to_addresses().is_empty();
        let webhook_enabled = config::enable_webhook_notifications();

        if !email_enabled && !webhook_enabled {
            tracing::warn!("no notification channels enabled or configured");
            return;
        }

        if email_enabled {
            let recipients = config::email_to_addresses();
            let subject = format!("Node Alert: {} - {}", alert_type, severity);
            let html = email::format_email_content(alert_type, severity, message, details);
            email::send_email_notification(&recipients, &subject, &html).await;
        }

        if webhook_enabled {
            if let Some(url) = config::webhook_discord_url() {
                send_webhook_notification(
                    &self.http,
                    &url,
                    WebhookPlatform::Discord,
                    alert_type,
                    severity,
                    message,
                    details,
                )
                .await;
            }
            if let Some(url) = config::webhook_slack_url() {
                send_webhook_notification(
                    &self.http,
                    &url,
                    WebhookPlatform::Slack,
                    alert_type,
                    severity,
                    message,
                    details,
                )
                .await;
            }
            for url in config::webhook_custom_urls() {
                send_webhook_notification(
                    &self.http,
                    &url,
                    WebhookPlatform::Custom,
                    alert_type,
                    severity,
                    message,
                    details,
                )
                .await;
            }
        }
    }
}

impl Default for NotificationHandler {
    fn default() -> Self {
        Self::new()
    }
}
