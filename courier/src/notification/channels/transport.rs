//! Outbound transports used by the channel adapters.
//!
//! Each channel talks to the outside world only through one of these traits,
//! so tests and local runs can swap in the log-only implementations.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// A fully rendered email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub from_email: String,
    pub from_name: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait EmailTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, message: &EmailMessage) -> Result<()>;

    /// Verify the transport is usable.
    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

/// A push notification for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub user_id: String,
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub icon: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_text: Option<String>,
    pub category: String,
    pub module: String,
    pub platform: String,
    pub timestamp: String,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    fn name(&self) -> &'static str;

    async fn push(&self, message: &PushMessage) -> Result<()>;

    async fn check(&self) -> Result<()> {
        Ok(())
    }
}

/// Mail API transport speaking the SendGrid v3 `mail/send` format.
pub struct HttpMailTransport {
    client: Client,
    api_url: String,
    api_key: String,
}

impl HttpMailTransport {
    pub fn new(api_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    fn request_body(message: &EmailMessage) -> Value {
        json!({
            "personalizations": [{ "to": [{ "email": message.to }] }],
            "from": { "email": message.from_email, "name": message.from_name },
            "subject": message.subject,
            "content": [
                { "type": "text/plain", "value": message.text },
                { "type": "text/html", "value": message.html }
            ]
        })
    }
}

#[async_trait]
impl EmailTransport for HttpMailTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn send(&self, message: &EmailMessage) -> Result<()> {
        let response = self
            .client
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&Self::request_body(message))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(to = %message.to, %status, "Mail API rejected message: {}", body);
            return Err(Error::delivery(format!(
                "mail API returned {}: {}",
                status, body
            )));
        }

        debug!(to = %message.to, "Email accepted by mail API");
        Ok(())
    }

    async fn check(&self) -> Result<()> {
        reqwest::Url::parse(&self.api_url)
            .map_err(|e| Error::config(format!("invalid mail API url '{}': {}", self.api_url, e)))?;
        if self.api_key.is_empty() {
            return Err(Error::config("mail API key is empty"));
        }
        Ok(())
    }
}

/// Transport that only logs the message.
#[derive(Debug, Default)]
pub struct LogEmailTransport;

#[async_trait]
impl EmailTransport for LogEmailTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn send(&self, message: &EmailMessage) -> Result<()> {
        info!(to = %message.to, subject = %message.subject, "Email (log transport)");
        Ok(())
    }
}

/// Push gateway reached through an HTTP webhook.
pub struct WebhookPushTransport {
    client: Client,
    url: String,
    auth_token: Option<String>,
}

impl WebhookPushTransport {
    pub fn new(url: impl Into<String>, auth_token: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            client,
            url: url.into(),
            auth_token,
        }
    }
}

#[async_trait]
impl PushTransport for WebhookPushTransport {
    fn name(&self) -> &'static str {
        "webhook"
    }

    async fn push(&self, message: &PushMessage) -> Result<()> {
        let mut request = self.client.post(&self.url).json(message);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(user_id = %message.user_id, %status, "Push gateway rejected message: {}", body);
            return Err(Error::delivery(format!(
                "push gateway returned {}: {}",
                status, body
            )));
        }

        debug!(user_id = %message.user_id, "Push notification accepted by gateway");
        Ok(())
    }

    async fn check(&self) -> Result<()> {
        reqwest::Url::parse(&self.url)
            .map(|_| ())
            .map_err(|e| Error::config(format!("invalid push gateway url '{}': {}", self.url, e)))
    }
}

#[derive(Debug, Default)]
pub struct LogPushTransport;

#[async_trait]
impl PushTransport for LogPushTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn push(&self, message: &PushMessage) -> Result<()> {
        info!(user_id = %message.user_id, title = %message.title, "Push notification (log transport)");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn email() -> EmailMessage {
        EmailMessage {
            to: "winner@example.com".to_string(),
            from_email: "noreply@example.com".to_string(),
            from_name: "Courier".to_string(),
            subject: "You won".to_string(),
            html: "<p>You won</p>".to_string(),
            text: "You won".to_string(),
        }
    }

    #[test]
    fn test_mail_request_body_shape() {
        let body = HttpMailTransport::request_body(&email());
        assert_eq!(body["personalizations"][0]["to"][0]["email"], "winner@example.com");
        assert_eq!(body["from"]["name"], "Courier");
        assert_eq!(body["content"][0]["type"], "text/plain");
        assert_eq!(body["content"][1]["value"], "<p>You won</p>");
    }

    #[tokio::test]
    async fn test_http_mail_check() {
        let ok = HttpMailTransport::new("https://api.example.com/v3/mail/send", "key", Duration::from_secs(5));
        assert!(ok.check().await.is_ok());

        let bad_url = HttpMailTransport::new("not a url", "key", Duration::from_secs(5));
        assert!(matches!(bad_url.check().await, Err(Error::Configuration(_))));

        let no_key = HttpMailTransport::new("https://api.example.com", "", Duration::from_secs(5));
        assert!(no_key.check().await.is_err());
    }

    #[test]
    fn test_push_message_serialization() {
        let message = PushMessage {
            user_id: "42".to_string(),
            title: "Hello".to_string(),
            body: "World".to_string(),
            kind: "success".to_string(),
            icon: "check-circle".to_string(),
            action_url: None,
            action_text: None,
            category: "notification".to_string(),
            module: "general".to_string(),
            platform: "web".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "success");
        assert!(json.get("action_url").is_none());
    }

    #[tokio::test]
    async fn test_log_transports_always_succeed() {
        assert!(LogEmailTransport.send(&email()).await.is_ok());
        assert_eq!(LogEmailTransport.name(), "log");
        assert!(LogPushTransport.check().await.is_ok());
    }
}
