//! Push notification channel.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::transport::{LogPushTransport, PushMessage, PushTransport, WebhookPushTransport};
use super::{
    ChannelHealth, ChannelService, ChannelStatus, LaneOptions, ServiceState, priority_from_event,
    required_str,
};
use crate::notification::task::{NotificationTask, Payload};
use crate::queue::{PriorityQueue, QueueManager, QueueTask, TaskHandler, TaskOutcome};
use crate::rate_limit::{Admission, RateLimitConfig, RateLimiterManager};
use crate::{Error, Result};

/// Queue lane owned by the push channel.
pub const PUSH_QUEUE: &str = "notifications";

const PUSH_PROCESSOR: &str = "notification_processor";
const PUSH_TASK_KIND: &str = "push_notification";

/// Icon shown for a notification type.
pub fn icon_for_type(kind: &str) -> &'static str {
    match kind {
        "success" => "check-circle",
        "info" => "info-circle",
        "warning" => "exclamation-triangle",
        "error" => "times-circle",
        "alert" => "bell",
        "trophy" => "trophy",
        "message" => "envelope",
        _ => "bell",
    }
}

/// Push channel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushSettings {
    /// Gateway webhook. Without one, notifications are only logged.
    pub gateway_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub auth_token: Option<String>,
    /// Gateway request timeout in seconds (0 uses 30).
    #[serde(default)]
    pub request_timeout_secs: u64,
}

impl PushSettings {
    fn default_transport(&self) -> Arc<dyn PushTransport> {
        let timeout = match self.request_timeout_secs {
            0 => Duration::from_secs(30),
            secs => Duration::from_secs(secs),
        };
        match self.gateway_url.as_deref().filter(|u| !u.is_empty()) {
            Some(url) => Arc::new(WebhookPushTransport::new(
                url,
                self.auth_token.clone(),
                timeout,
            )),
            None => Arc::new(LogPushTransport),
        }
    }
}

fn payload_string(payload: &Payload, key: &str, default: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_string()
}

fn optional_string(payload: &Payload, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(str::to_string)
}

/// User ids arrive as strings or numbers.
fn user_id(event: &Payload) -> Result<String> {
    match event.get("user_id") {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        _ => Err(Error::validation("missing required field 'user_id'")),
    }
}

struct PushDelivery {
    transport: Arc<dyn PushTransport>,
    state: Arc<ServiceState>,
}

impl PushDelivery {
    fn message_for(task: &NotificationTask) -> Result<PushMessage> {
        let p = &task.payload;
        Ok(PushMessage {
            user_id: task.recipient.clone(),
            title: required_str(p, "title")?.to_string(),
            body: required_str(p, "body")?.to_string(),
            kind: payload_string(p, "type", "info"),
            icon: payload_string(p, "icon", "bell"),
            action_url: optional_string(p, "action_url"),
            action_text: optional_string(p, "action_text"),
            category: payload_string(p, "category", "notification"),
            module: payload_string(p, "module", "general"),
            platform: payload_string(p, "platform", "web"),
            timestamp: payload_string(p, "timestamp", ""),
        })
    }
}

#[async_trait]
impl TaskHandler for PushDelivery {
    async fn deliver(&self, task: &NotificationTask) -> Result<bool> {
        let result = match Self::message_for(task) {
            Ok(message) => self.transport.push(&message).await,
            Err(e) => Err(e),
        };

        self.state.record(result.is_ok());
        result.map(|()| {
            info!(user_id = %task.recipient, task_id = %task.id(), "Push notification sent");
            true
        })
    }
}

/// In-app push notifications with per-recipient hourly limits.
pub struct PushChannel {
    state: Arc<ServiceState>,
    queues: Arc<QueueManager>,
    queue: Arc<PriorityQueue>,
    recipient_limits: RateLimiterManager,
    max_per_recipient_per_hour: u32,
    transport: Arc<dyn PushTransport>,
    lane: LaneOptions,
}

impl PushChannel {
    pub fn new(
        settings: PushSettings,
        max_per_recipient_per_hour: u32,
        lane: LaneOptions,
        queues: Arc<QueueManager>,
    ) -> Self {
        let queue = queues.create_queue(PUSH_QUEUE);
        Self {
            state: Arc::new(ServiceState::new("notification")),
            queue,
            queues,
            recipient_limits: RateLimiterManager::new(RateLimitConfig::hourly(
                max_per_recipient_per_hour,
            )),
            max_per_recipient_per_hour,
            transport: settings.default_transport(),
            lane,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn PushTransport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    /// Drop per-recipient windows that no longer hold any sends.
    pub fn prune_rate_limits(&self) -> usize {
        self.recipient_limits.prune_idle()
    }
}

#[async_trait]
impl ChannelService for PushChannel {
    fn state(&self) -> &ServiceState {
        &self.state
    }

    async fn initialize(&self) -> Result<()> {
        self.transport.check().await?;

        let handler: Arc<dyn TaskHandler> = Arc::new(PushDelivery {
            transport: self.transport.clone(),
            state: self.state.clone(),
        });
        let processor = self.queues.create_processor(
            PUSH_PROCESSOR,
            PUSH_QUEUE,
            handler,
            self.lane.processor.clone(),
            None,
        )?;
        processor.start();

        info!(transport = self.transport.name(), "Push channel initialized");
        Ok(())
    }

    async fn submit(&self, task: NotificationTask) -> Result<oneshot::Receiver<TaskOutcome>> {
        if self.status() != ChannelStatus::Active {
            return Err(Error::delivery(format!(
                "service {} is {}",
                self.name(),
                self.status()
            )));
        }
        PushDelivery::message_for(&task)?;

        if let Admission::Denied { reason, .. } = self.recipient_limits.try_admit(&task.recipient) {
            warn!(user_id = %task.recipient, "Rate limit exceeded for recipient");
            return Err(Error::RateLimited(format!(
                "recipient {}: {}",
                task.recipient, reason
            )));
        }

        debug!(user_id = %task.recipient, task_id = %task.id(), priority = %task.priority, "Queueing push notification");
        let (queue_task, receiver) =
            QueueTask::new(task, self.lane.retry_delay_base).with_completion();
        self.queue.add(queue_task);
        Ok(receiver)
    }

    fn task_for_event(&self, event: &Payload) -> Result<NotificationTask> {
        let recipient = user_id(event)?;
        let kind = payload_string(event, "type", "info");

        let mut payload = Payload::new();
        payload.insert("user_id".to_string(), Value::from(recipient.clone()));
        payload.insert("title".to_string(), Value::from(required_str(event, "title")?));
        payload.insert("body".to_string(), Value::from(required_str(event, "body")?));
        payload.insert("icon".to_string(), Value::from(icon_for_type(&kind)));
        payload.insert("type".to_string(), Value::from(kind));
        for key in ["action_url", "action_text"] {
            if let Some(value) = optional_string(event, key) {
                payload.insert(key.to_string(), Value::from(value));
            }
        }
        payload.insert("platform".to_string(), Value::from(payload_string(event, "platform", "web")));
        payload.insert("module".to_string(), Value::from(payload_string(event, "module", "general")));
        payload.insert(
            "category".to_string(),
            Value::from(payload_string(event, "category", "notification")),
        );
        payload.insert("timestamp".to_string(), Value::from(Utc::now().to_rfc3339()));

        Ok(NotificationTask::new(PUSH_TASK_KIND, recipient, payload)
            .with_priority(priority_from_event(event))
            .with_max_retries(self.lane.max_retries))
    }

    async fn health_check(&self) -> Result<ChannelHealth> {
        let details = json!({
            "transport": self.transport.name(),
            "queue": self.queue.stats(),
            "metrics": self.metrics(),
            "rate_limiting": {
                "max_per_hour": self.max_per_recipient_per_hour,
                "active_rate_limits": self.recipient_limits.len(),
            },
        });

        Ok(match self.transport.check().await {
            Ok(()) => ChannelHealth::healthy(details),
            Err(e) => ChannelHealth::unhealthy(e.to_string(), details),
        })
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(processor) = self.queues.remove_processor(PUSH_PROCESSOR) {
            processor.stop().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::ProcessorConfig;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FlakyTransport {
        failures_left: AtomicU32,
        pushed: Mutex<Vec<PushMessage>>,
    }

    #[async_trait]
    impl PushTransport for FlakyTransport {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn push(&self, message: &PushMessage) -> Result<()> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(Error::delivery("gateway unavailable"));
            }
            self.pushed.lock().push(message.clone());
            Ok(())
        }
    }

    fn channel(transport: Arc<FlakyTransport>, per_hour: u32) -> PushChannel {
        let lane = LaneOptions {
            processor: ProcessorConfig {
                max_workers: 2,
                poll_interval_ms: 10,
                delivery_timeout_secs: 5,
                shutdown_timeout_secs: 1,
            },
            max_retries: 2,
            retry_delay_base: Duration::ZERO,
        };
        PushChannel::new(PushSettings::default(), per_hour, lane, Arc::new(QueueManager::new()))
            .with_transport(transport)
    }

    fn event(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_icon_for_type() {
        assert_eq!(icon_for_type("success"), "check-circle");
        assert_eq!(icon_for_type("warning"), "exclamation-triangle");
        assert_eq!(icon_for_type("message"), "envelope");
        assert_eq!(icon_for_type("unknown"), "bell");
    }

    #[test]
    fn test_task_for_event() {
        let channel = channel(Arc::default(), 10);
        let task = channel
            .task_for_event(&event(json!({
                "user_id": 42,
                "title": "You won",
                "body": "Ticket 7 matched",
                "type": "trophy",
                "action_url": "/tickets/7",
                "priority": "urgent",
            })))
            .unwrap();

        assert_eq!(task.kind, "push_notification");
        assert_eq!(task.recipient, "42");
        assert_eq!(task.payload_str("icon"), Some("trophy"));
        assert_eq!(task.payload_str("action_url"), Some("/tickets/7"));
        assert_eq!(task.payload_str("module"), Some("general"));
        assert_eq!(task.priority, crate::notification::task::TaskPriority::Urgent);

        assert!(channel.task_for_event(&event(json!({"title": "x", "body": "y"}))).is_err());
    }

    #[tokio::test]
    async fn test_push_retries_then_delivers() {
        let transport = Arc::new(FlakyTransport {
            failures_left: AtomicU32::new(2),
            ..Default::default()
        });
        let channel = channel(transport.clone(), 10);
        assert!(channel.start().await);

        let task = channel
            .task_for_event(&event(json!({"user_id": "7", "title": "Hi", "body": "There"})))
            .unwrap();
        let rx = channel.submit(task).await.unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.retries, 2);
        assert_eq!(transport.pushed.lock().len(), 1);

        let metrics = channel.metrics();
        assert_eq!(metrics.messages_sent, 1);
        assert_eq!(metrics.messages_failed, 2);
        channel.stop().await;
    }

    #[tokio::test]
    async fn test_per_recipient_hourly_limit() {
        let channel = channel(Arc::default(), 2);
        assert!(channel.start().await);

        let make = |user: &str| {
            channel
                .task_for_event(&event(json!({"user_id": user, "title": "Hi", "body": "There"})))
                .unwrap()
        };

        assert!(channel.submit(make("1")).await.is_ok());
        assert!(channel.submit(make("1")).await.is_ok());
        assert!(matches!(
            channel.submit(make("1")).await,
            Err(Error::RateLimited(_))
        ));
        assert!(channel.submit(make("2")).await.is_ok());

        let health = channel.health_check().await.unwrap();
        assert_eq!(health.details["rate_limiting"]["active_rate_limits"], 2);
        channel.stop().await;
    }
}
