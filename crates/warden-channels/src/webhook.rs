//! Webhook notification channel.
//!
//! Delivers each alert as a JSON POST to a fixed endpoint. The endpoint is
//! expected to fan the message out to its own transport (SMS gateway, email
//! relay, chat). Non-2xx responses count as delivery failures.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use warden_types::errors::WardenError;
use warden_types::traits::NotificationChannel;

/// Configuration for [`WebhookChannel`].
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Endpoint receiving the POST.
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` when present.
    pub auth_token: Option<String>,
    /// Whole-request timeout.
    pub timeout: Duration,
}

/// JSON body posted for every delivery.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookPayload<'a> {
    pub source: &'static str,
    pub recipient: &'a str,
    pub message: &'a str,
    pub sent_at: DateTime<Utc>,
}

/// Notification channel posting alerts to an HTTP endpoint.
pub struct WebhookChannel {
    client: reqwest::Client,
    config: WebhookConfig,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Result<Self, WardenError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| WardenError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    pub fn url(&self) -> &str {
        &self.config.url
    }

    fn payload<'a>(recipient: &'a str, message: &'a str) -> WebhookPayload<'a> {
        WebhookPayload {
            source: "warden",
            recipient,
            message,
            sent_at: Utc::now(),
        }
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, recipient: &str, message: &str) -> Result<(), WardenError> {
        let mut request = self
            .client
            .post(&self.config.url)
            .json(&Self::payload(recipient, message));
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WardenError::Delivery(format!("webhook request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WardenError::Delivery(format!(
                "webhook returned {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        tracing::debug!(url = %self.config.url, recipient = %recipient, "webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> WebhookConfig {
        WebhookConfig {
            url: url.to_string(),
            auth_token: Some("secret".to_string()),
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_payload_shape() {
        let payload = WebhookChannel::payload("ops@example.com", "[ALERT] x changed");
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["source"], "warden");
        assert_eq!(json["recipient"], "ops@example.com");
        assert_eq!(json["message"], "[ALERT] x changed");
        assert!(json["sent_at"].is_string());
    }

    #[test]
    fn test_new_keeps_url() {
        let channel = WebhookChannel::new(config("https://hooks.example.com/w")).unwrap();
        assert_eq!(channel.url(), "https://hooks.example.com/w");
        assert_eq!(channel.name(), "webhook");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_delivery_error() {
        // Port 9 (discard) is not expected to be listening locally.
        let channel = WebhookChannel::new(config("http://127.0.0.1:9/alerts")).unwrap();
        let err = channel.deliver("ops", "msg").await.unwrap_err();
        assert!(matches!(err, WardenError::Delivery(_)));
    }
}
