//! Delivery channels.
//!
//! A channel turns a dispatched event into a [`NotificationTask`], queues it
//! on its own lane and reports the outcome once a worker has delivered or
//! given up on it. Channels available:
//! - Email (HTTP mail API)
//! - Push (webhook gateway)

mod email;
mod push;
pub mod transport;

pub use email::{EMAIL_QUEUE, EmailChannel, EmailSettings, html_to_text};
pub use push::{PUSH_QUEUE, PushChannel, PushSettings, icon_for_type};

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use super::task::{DEFAULT_MAX_RETRIES, NotificationTask, Payload, TaskPriority};
use crate::queue::priority_queue::DEFAULT_RETRY_DELAY_BASE;
use crate::queue::{ProcessorConfig, TaskOutcome};
use crate::{Error, Result};

/// Queue and retry settings for a channel's lane.
#[derive(Debug, Clone)]
pub struct LaneOptions {
    pub processor: ProcessorConfig,
    /// Retry budget given to tasks built from events.
    pub max_retries: u32,
    /// Base of the linear retry backoff.
    pub retry_delay_base: Duration,
}

impl Default for LaneOptions {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_base: DEFAULT_RETRY_DELAY_BASE,
        }
    }
}

/// Lifecycle status of a channel service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    #[default]
    Inactive,
    Error,
    Maintenance,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Error => "error",
            Self::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// Outcome of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Error,
}

/// Health report for one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelHealth {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Channel-specific details (queue stats, limits, metrics).
    #[serde(default)]
    pub details: serde_json::Value,
}

impl ChannelHealth {
    pub fn healthy(details: serde_json::Value) -> Self {
        Self {
            status: HealthStatus::Healthy,
            error: None,
            details,
        }
    }

    pub fn unhealthy(error: impl Into<String>, details: serde_json::Value) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            error: Some(error.into()),
            details,
        }
    }

    /// Report for a health check that itself failed.
    pub fn from_error(error: &Error) -> Self {
        Self {
            status: HealthStatus::Error,
            error: Some(error.to_string()),
            details: serde_json::Value::Null,
        }
    }
}

/// Snapshot of a service's delivery counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetrics {
    pub service_name: String,
    pub status: ChannelStatus,
    pub messages_sent: u64,
    pub messages_failed: u64,
    pub last_activity: Option<DateTime<Utc>>,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: i64,
}

/// Lifecycle status and counters shared by every channel implementation.
#[derive(Debug)]
pub struct ServiceState {
    name: String,
    status: RwLock<ChannelStatus>,
    messages_sent: AtomicU64,
    messages_failed: AtomicU64,
    last_activity: RwLock<Option<DateTime<Utc>>>,
    started_at: RwLock<DateTime<Utc>>,
}

impl ServiceState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: RwLock::new(ChannelStatus::Inactive),
            messages_sent: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            last_activity: RwLock::new(None),
            started_at: RwLock::new(Utc::now()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ChannelStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: ChannelStatus) {
        *self.status.write() = status;
    }

    fn mark_started(&self) {
        *self.started_at.write() = Utc::now();
        self.set_status(ChannelStatus::Active);
    }

    /// Count one delivery attempt.
    pub fn record(&self, success: bool) {
        if success {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            self.messages_failed.fetch_add(1, Ordering::Relaxed);
        }
        *self.last_activity.write() = Some(Utc::now());
    }

    pub fn metrics(&self) -> ServiceMetrics {
        let started_at = *self.started_at.read();
        ServiceMetrics {
            service_name: self.name.clone(),
            status: self.status(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_failed: self.messages_failed.load(Ordering::Relaxed),
            last_activity: *self.last_activity.read(),
            started_at,
            uptime_seconds: (Utc::now() - started_at).num_seconds(),
        }
    }
}

/// A delivery channel managed by the service registry.
#[async_trait]
pub trait ChannelService: Send + Sync {
    /// Shared lifecycle state.
    fn state(&self) -> &ServiceState;

    /// Bring up transports and worker pools.
    async fn initialize(&self) -> Result<()>;

    /// Validate and queue a task, returning a handle to its final outcome.
    async fn submit(&self, task: NotificationTask) -> Result<oneshot::Receiver<TaskOutcome>>;

    /// Build this channel's task for a dispatched event.
    fn task_for_event(&self, event: &Payload) -> Result<NotificationTask>;

    /// Check the channel.
    async fn health_check(&self) -> Result<ChannelHealth>;

    /// Release resources. Called by [`stop`](Self::stop).
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        self.state().name()
    }

    fn status(&self) -> ChannelStatus {
        self.state().status()
    }

    fn metrics(&self) -> ServiceMetrics {
        self.state().metrics()
    }

    /// Initialize and mark the service active, or mark it errored.
    async fn start(&self) -> bool {
        match self.initialize().await {
            Ok(()) => {
                self.state().mark_started();
                info!(service = %self.name(), "Service started");
                true
            }
            Err(e) => {
                self.state().set_status(ChannelStatus::Error);
                error!(service = %self.name(), "Failed to start service: {}", e);
                false
            }
        }
    }

    /// Shut down and mark the service inactive.
    async fn stop(&self) -> bool {
        match self.shutdown().await {
            Ok(()) => {
                self.state().set_status(ChannelStatus::Inactive);
                info!(service = %self.name(), "Service stopped");
                true
            }
            Err(e) => {
                self.state().set_status(ChannelStatus::Error);
                error!(service = %self.name(), "Error stopping service: {}", e);
                false
            }
        }
    }

    /// Submit a task and wait for its final outcome.
    ///
    /// Returns `Ok(false)` when the task ended up dead-lettered.
    async fn send_notification(&self, task: NotificationTask) -> Result<bool> {
        let task_id = task.id();
        let receiver = self.submit(task).await?;
        match receiver.await {
            Ok(outcome) => Ok(outcome.success),
            Err(_) => {
                warn!(service = %self.name(), task_id = %task_id, "Task dropped before completion");
                Err(Error::delivery(format!(
                    "task {} was dropped before completion",
                    task_id
                )))
            }
        }
    }
}

/// Priority requested by an event, `normal` when absent or unknown.
pub(crate) fn priority_from_event(event: &Payload) -> TaskPriority {
    event
        .get("priority")
        .and_then(serde_json::Value::as_str)
        .map(TaskPriority::parse_lenient)
        .unwrap_or_default()
}

/// Read a required string field from an event payload.
pub(crate) fn required_str<'a>(event: &'a Payload, key: &str) -> Result<&'a str> {
    event
        .get(key)
        .and_then(serde_json::Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| Error::validation(format!("missing required field '{}'", key)))
}
