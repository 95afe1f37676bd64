//! Notification task model.
//!
//! A [`NotificationTask`] is the unit of work that flows from the dispatcher
//! into a channel's queue and through a worker pool. Its status only moves
//! forward through the delivery state machine:
//!
//! ```text
//! pending ──► processing ──► delivered
//!                 │  ▲
//!                 │  └──────── retrying
//!                 ├──► retrying
//!                 └──► failed
//! ```
//!
//! `delivered` and `failed` are terminal.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{Error, Result};

/// Default retry budget for new tasks.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Opaque task payload (string keys to JSON values).
pub type Payload = Map<String, Value>;

/// Priority tier of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background notifications.
    Low,
    /// Standard notifications.
    #[default]
    Normal,
    /// Important notifications.
    High,
    /// Must go out before anything else.
    Urgent,
}

impl TaskPriority {
    /// Tiers in the order a queue drains them.
    pub const DRAIN_ORDER: [TaskPriority; 4] = [
        TaskPriority::Urgent,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];

    /// Parse a priority, falling back to `Normal` for unknown values.
    pub fn parse_lenient(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }

    pub(crate) fn tier_index(self) -> usize {
        match self {
            Self::Urgent => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Normal => write!(f, "normal"),
            Self::High => write!(f, "high"),
            Self::Urgent => write!(f, "urgent"),
        }
    }
}

impl FromStr for TaskPriority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" | "critical" => Ok(Self::Urgent),
            other => Err(Error::validation(format!("unknown priority '{}'", other))),
        }
    }
}

/// Delivery status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Processing,
    Delivered,
    Failed,
    Retrying,
}

impl DeliveryStatus {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }

    /// Whether `self -> next` is an edge of the delivery state machine.
    pub fn can_transition_to(self, next: DeliveryStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Retrying, Self::Processing)
                | (Self::Processing, Self::Delivered)
                | (Self::Processing, Self::Retrying)
                | (Self::Processing, Self::Failed)
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
        };
        f.write_str(s)
    }
}

impl FromStr for DeliveryStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "delivered" => Ok(Self::Delivered),
            "failed" => Ok(Self::Failed),
            "retrying" => Ok(Self::Retrying),
            other => Err(Error::validation(format!("unknown delivery status '{}'", other))),
        }
    }
}

/// A unit of notification work addressed to one recipient on one channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationTask {
    id: Uuid,
    /// Channel-specific task kind (e.g. `email`, `push_notification`).
    pub kind: String,
    /// Recipient identifier (email address, user id, ...).
    pub recipient: String,
    /// Pre-rendered content and channel-specific fields.
    pub payload: Payload,
    /// Priority tier.
    pub priority: TaskPriority,
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    retry_count: u32,
    status: DeliveryStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    error_message: Option<String>,
}

impl NotificationTask {
    /// Create a new pending task with a fresh id.
    pub fn new(kind: impl Into<String>, recipient: impl Into<String>, payload: Payload) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            recipient: recipient.into(),
            payload,
            priority: TaskPriority::Normal,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_count: 0,
            status: DeliveryStatus::Pending,
            created_at: now,
            updated_at: now,
            error_message: None,
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn status(&self) -> DeliveryStatus {
        self.status
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Read a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Whether another retry may be scheduled after a failure.
    pub fn has_retry_budget(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Move to `next`, rejecting edges outside the state machine.
    pub fn transition(&mut self, next: DeliveryStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Enter `processing` for a delivery attempt.
    pub fn begin_attempt(&mut self) -> Result<()> {
        self.transition(DeliveryStatus::Processing)
    }

    /// Record a successful delivery.
    pub fn mark_delivered(&mut self) -> Result<()> {
        self.transition(DeliveryStatus::Delivered)
    }

    /// Record a failed attempt.
    ///
    /// Consumes one unit of retry budget and moves to `retrying`, or moves
    /// straight to `failed` when the budget is exhausted. Returns `true` when a
    /// retry should be scheduled.
    pub fn record_failure(&mut self, error: impl Into<String>) -> Result<bool> {
        if self.status != DeliveryStatus::Processing {
            return Err(Error::InvalidStateTransition {
                from: self.status.to_string(),
                to: "retrying|failed".to_string(),
            });
        }

        self.error_message = Some(error.into());
        if self.has_retry_budget() {
            self.retry_count += 1;
            self.transition(DeliveryStatus::Retrying)?;
            Ok(true)
        } else {
            self.transition(DeliveryStatus::Failed)?;
            Ok(false)
        }
    }

    /// Administrative reset used when re-injecting dead letters.
    ///
    /// This is the only path out of a terminal state and starts a fresh
    /// lifecycle with a full retry budget.
    pub fn reset_for_requeue(&mut self) {
        self.retry_count = 0;
        self.status = DeliveryStatus::Pending;
        self.updated_at = Utc::now();
    }
}
