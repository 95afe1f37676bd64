//! Email channel.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::transport::{EmailMessage, EmailTransport, HttpMailTransport, LogEmailTransport};
use super::{ChannelHealth, ChannelService, LaneOptions, ServiceState, priority_from_event, required_str};
use crate::notification::task::{NotificationTask, Payload};
use crate::queue::{PriorityQueue, QueueManager, QueueTask, TaskHandler, TaskOutcome};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::{Error, Result};

/// Queue lane owned by the email channel.
pub const EMAIL_QUEUE: &str = "emails";

const EMAIL_PROCESSOR: &str = "email_processor";
const EMAIL_TASK_KIND: &str = "email";

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("valid email regex")
});
static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^<]+?>").expect("valid tag regex"));
static WHITESPACE_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid whitespace regex"));

/// Strip tags and collapse whitespace.
pub fn html_to_text(html: &str) -> String {
    let text = TAG_REGEX.replace_all(html, "");
    WHITESPACE_REGEX.replace_all(&text, " ").trim().to_string()
}

/// Email channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailSettings {
    /// Mail API endpoint.
    pub api_url: String,
    /// Mail API key. Without one, emails are only logged.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub sender_email: String,
    pub sender_name: String,
    /// Maximum subject length in characters.
    pub max_subject_length: usize,
    /// Maximum HTML body length in characters.
    pub max_body_length: usize,
    /// Recipient domains that are never mailed.
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    /// Mail API request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            api_url: "https://api.sendgrid.com/v3/mail/send".to_string(),
            api_key: None,
            sender_email: "noreply@localhost".to_string(),
            sender_name: "Courier".to_string(),
            max_subject_length: 78,
            max_body_length: 1_000_000,
            blocked_domains: Vec::new(),
            request_timeout_secs: 30,
        }
    }
}

impl EmailSettings {
    /// Reject content a mail provider would flag or refuse.
    pub fn validate(&self, recipient: &str, subject: &str, body: &str) -> Result<()> {
        if !EMAIL_REGEX.is_match(recipient) {
            return Err(Error::validation(format!("invalid email format: {}", recipient)));
        }

        let domain = recipient
            .rsplit_once('@')
            .map(|(_, d)| d.to_ascii_lowercase())
            .unwrap_or_default();
        if self
            .blocked_domains
            .iter()
            .any(|blocked| blocked.eq_ignore_ascii_case(&domain))
        {
            return Err(Error::validation(format!("blocked domain: {}", domain)));
        }

        let subject_len = subject.chars().count();
        if subject_len > self.max_subject_length {
            return Err(Error::validation(format!(
                "subject too long: {} characters",
                subject_len
            )));
        }

        let body_len = body.chars().count();
        if body_len > self.max_body_length {
            return Err(Error::validation(format!("body too long: {} characters", body_len)));
        }

        if body.contains("<html>") && !body.contains("</html>") {
            return Err(Error::validation("malformed HTML structure"));
        }

        Ok(())
    }

    fn default_transport(&self) -> Arc<dyn EmailTransport> {
        match self.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => Arc::new(HttpMailTransport::new(
                self.api_url.clone(),
                key,
                Duration::from_secs(self.request_timeout_secs),
            )),
            None => Arc::new(LogEmailTransport),
        }
    }
}

struct EmailDelivery {
    transport: Arc<dyn EmailTransport>,
    sender_email: String,
    sender_name: String,
    state: Arc<ServiceState>,
}

impl EmailDelivery {
    fn message_for(&self, task: &NotificationTask) -> Result<EmailMessage> {
        let subject = required_str(&task.payload, "subject")?;
        let html = required_str(&task.payload, "body_html")?;
        let text = task
            .payload_str("body_text")
            .map(str::to_string)
            .unwrap_or_else(|| html_to_text(html));

        Ok(EmailMessage {
            to: task.recipient.clone(),
            from_email: task
                .payload_str("sender_email")
                .unwrap_or(&self.sender_email)
                .to_string(),
            from_name: self.sender_name.clone(),
            subject: subject.to_string(),
            html: html.to_string(),
            text,
        })
    }
}

#[async_trait]
impl TaskHandler for EmailDelivery {
    async fn deliver(&self, task: &NotificationTask) -> Result<bool> {
        let result = match self.message_for(task) {
            Ok(message) => self.transport.send(&message).await,
            Err(e) => Err(e),
        };

        self.state.record(result.is_ok());
        match result {
            Ok(()) => {
                info!(to = %task.recipient, task_id = %task.id(), "Email sent");
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }
}

/// Email delivery through a mail API, gated by a sliding-window limiter.
pub struct EmailChannel {
    state: Arc<ServiceState>,
    settings: EmailSettings,
    queues: Arc<QueueManager>,
    queue: Arc<PriorityQueue>,
    limiter: Arc<RateLimiter>,
    transport: Arc<dyn EmailTransport>,
    lane: LaneOptions,
}

impl EmailChannel {
    pub fn new(
        settings: EmailSettings,
        limits: RateLimitConfig,
        lane: LaneOptions,
        queues: Arc<QueueManager>,
    ) -> Self {
        let transport = settings.default_transport();
        let queue = queues.create_queue(EMAIL_QUEUE);
        Self {
            state: Arc::new(ServiceState::new("email")),
            settings,
            queue,
            queues,
            limiter: Arc::new(RateLimiter::new(EMAIL_QUEUE, limits)),
            transport,
            lane,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn EmailTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn settings(&self) -> &EmailSettings {
        &self.settings
    }

    fn validate_task(&self, task: &NotificationTask) -> Result<()> {
        let subject = required_str(&task.payload, "subject")?;
        let body = required_str(&task.payload, "body_html")?;
        self.settings.validate(&task.recipient, subject, body)
    }
}

#[async_trait]
impl ChannelService for EmailChannel {
    fn state(&self) -> &ServiceState {
        &self.state
    }

    async fn initialize(&self) -> Result<()> {
        self.transport.check().await?;

        let handler: Arc<dyn TaskHandler> = Arc::new(EmailDelivery {
            transport: self.transport.clone(),
            sender_email: self.settings.sender_email.clone(),
            sender_name: self.settings.sender_name.clone(),
            state: self.state.clone(),
        });
        let processor = self.queues.create_processor(
            EMAIL_PROCESSOR,
            EMAIL_QUEUE,
            handler,
            self.lane.processor.clone(),
            Some(self.limiter.clone()),
        )?;
        processor.start();

        info!(transport = self.transport.name(), "Email channel initialized");
        Ok(())
    }

    async fn submit(&self, task: NotificationTask) -> Result<oneshot::Receiver<TaskOutcome>> {
        if self.status() != super::ChannelStatus::Active {
            return Err(Error::delivery(format!(
                "service {} is {}",
                self.name(),
                self.status()
            )));
        }
        self.validate_task(&task)?;

        debug!(to = %task.recipient, task_id = %task.id(), priority = %task.priority, "Queueing email");
        let (queue_task, receiver) =
            QueueTask::new(task, self.lane.retry_delay_base).with_completion();
        self.queue.add(queue_task);
        Ok(receiver)
    }

    fn task_for_event(&self, event: &Payload) -> Result<NotificationTask> {
        let recipient = required_str(event, "user_email")?;
        let subject = required_str(event, "subject")?;
        let body_html = required_str(event, "body_html")?;

        let mut payload = Payload::new();
        payload.insert("subject".to_string(), Value::from(subject));
        payload.insert("body_html".to_string(), Value::from(body_html));
        let body_text = event
            .get("body_text")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| html_to_text(body_html));
        payload.insert("body_text".to_string(), Value::from(body_text));
        if let Some(sender) = event.get("sender_email").and_then(Value::as_str) {
            payload.insert("sender_email".to_string(), Value::from(sender));
        }

        Ok(NotificationTask::new(EMAIL_TASK_KIND, recipient, payload)
            .with_priority(priority_from_event(event))
            .with_max_retries(self.lane.max_retries))
    }

    async fn health_check(&self) -> Result<ChannelHealth> {
        let usage = self.limiter.usage();
        let details = json!({
            "transport": self.transport.name(),
            "queue": self.queue.stats(),
            "metrics": self.metrics(),
            "rate_limit": {
                "sent_last_minute": usage.last_minute,
                "sent_last_hour": usage.last_hour,
            },
        });

        Ok(match self.transport.check().await {
            Ok(()) => ChannelHealth::healthy(details),
            Err(e) => ChannelHealth::unhealthy(e.to_string(), details),
        })
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(processor) = self.queues.remove_processor(EMAIL_PROCESSOR) {
            processor.stop().await;
        }
        Ok(())
    }
}
