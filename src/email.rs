/// Email Notification Sender
///
/// SMTP delivery (STARTTLS or implicit TLS) of HTML alert messages.
/// Best-effort: failures are logged, never raised to the caller.

use lettre::message::header::ContentType;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};

use crate::config;

/// Send one HTML notification to the configured recipients.
pub async fn send_email_notification(recipients: &[String], subject: &str, html_content: &str) {
    if recipients.is_empty() {
        tracing::warn!("no email recipients specified, skipping email notification");
        return;
    }
    let username = config::email_username();
    let password = config::email_password();
    if username.is_empty() || password.is_empty() {
        tracing::error!("email sender credentials are not configured, cannot send email");
        return;
    }
    let server = config::email_smtp_server();
    if server.is_empty() {
        tracing::error!("email SMTP server is not configured, cannot send email");
        return;
    }

    let from = match username.parse() {
        Ok(mailbox) => mailbox,
        Err(e) => {
            tracing::error!("invalid sender address '{}': {}", username, e);
            return;
        }
    };

    let mut builder = Message::builder()
        .from(from)
        .subject(subject)
        .header(ContentType::TEXT_HTML);
    let mut any_recipient = false;
    for recipient in recipients {
        match recipient.parse() {
            Ok(mailbox) => {
                builder = builder.to(mailbox);
                any_recipient = true;
            }
            Err(e) => tracing::warn!("skipping invalid recipient '{}': {}", recipient, e),
        }
    }
    if !any_recipient {
        return;
    }

    let message = match builder.body(html_content.to_string()) {
        Ok(message) => message,
        Err(e) => {
            tracing::error!("failed to build email message: {}", e);
            return;
        }
    };

    let transport = if config::email_use_tls() {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&server)
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&server)
    };
    let transport = match transport {
        Ok(builder) => builder
            .port(config::email_smtp_port())
            .credentials(Credentials::new(username, password))
            .build(),
        Err(e) => {
            tracing::error!("failed to configure SMTP transport: {}", e);
            return;
        }
    };

    match transport.send(message).await {
        Ok(_) => tracing::info!("successfully sent email to {}", recipients.join(", ")),
        Err(e) => tracing::error!("failed to send email: {}", e),
    }
}

/// HTML body for an alert email
pub fn format_email_content(
    alert_type: &str,
    severity: &str,
    message: &str,
    details: &serde_json::Value,
) -> String {
    let severity_color = match severity.to_uppercase().as_str() {
        "CRITICAL" => "#FF0000",
        "WARNING" => "#FFA500",
        "INFO" => "#0000FF",
        _ => "#000000",
    };

    let detail_rows = details
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(k, v)| format!("<p><strong>{}:</strong> {}</p>", k, v))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    format!(
        r#"<!DOCTYPE html>
<html>
<head>
  <style>
    body {{ font-family: Arial, sans-serif; margin: 20px; color: #333; }}
    .container {{ background-color: #f9f9f9; border: 1px solid #ddd; padding: 20px; border-radius: 8px; }}
    .header {{ background-color: {color}; color: white; padding: 10px 20px; border-radius: 5px 5px 0 0; margin: -20px -20px 20px -20px; }}
    .details {{ background-color: #eee; padding: 15px; border-radius: 5px; margin-top: 20px; }}
  </style>
</head>
<body>
  <div class="container">
    <div class="header"><h2>Node Alert: {severity_upper}</h2></div>
    <p><strong>Alert Type:</strong> {alert_type}</p>
    <p><strong>Message:</strong> {message}</p>
    <div class="details"><strong>Details:</strong>{details}</div>
    <p>This notification was sent by NodePulse.</p>
  </div>
</body>
</html>"#,
        color = severity_color,
        severity_upper = severity.to_uppercase(),
        alert_type = alert_type,
        message = message,
        details = detail_rows,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_email_content_includes_details() {
        let html = format_email_content(
            "storage_warning",
            "warning",
            "Storage is approaching capacity.",
            &json!({"node_name": "alpha", "used_percent": 85.2}),
        );
        assert!(html.contains("storage_warning"));
        assert!(html.contains("WARNING"));
        assert!(html.contains("#FFA500"));
        assert!(html.contains("alpha"));
        assert!(html.contains("used_percent"));
    }

    #[test]
    fn test_email_content_unknown_severity_defaults() {
        let html = format_email_content("t", "odd", "m", &json!({}));
        assert!(html.contains("#000000"));
    }
}
