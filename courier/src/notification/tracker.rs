//! Dispatch-level delivery tracking.
//!
//! One [`DispatchRecord`] exists per dispatched event. Channels report into it
//! as their sends finish, and the dispatcher finalizes it exactly once.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::task::Payload;

/// Overall state of a dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Pending,
    Completed,
    Failed,
}

/// Last reported outcome of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelOutcome {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub dispatch_id: Uuid,
    /// Originating event payload.
    pub data: Payload,
    pub status: DispatchStatus,
    pub channels: BTreeMap<String, ChannelOutcome>,
    /// Set on completion: whether at least one channel succeeded.
    pub overall_success: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Aggregate counters over tracked dispatches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryStats {
    pub total_dispatches: usize,
    pub completed: usize,
    pub failed: usize,
    pub pending: usize,
    /// `completed / total * 100`, `0` when nothing is tracked.
    pub success_rate: f64,
}

#[derive(Debug, Default)]
pub struct DeliveryTracker {
    dispatches: Mutex<HashMap<Uuid, DispatchRecord>>,
}

impl DeliveryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_tracking(&self, dispatch_id: Uuid, data: Payload) {
        self.start_tracking_at(dispatch_id, data, Utc::now());
    }

    pub fn start_tracking_at(&self, dispatch_id: Uuid, data: Payload, now: DateTime<Utc>) {
        let record = DispatchRecord {
            dispatch_id,
            data,
            status: DispatchStatus::Pending,
            channels: BTreeMap::new(),
            overall_success: None,
            created_at: now,
            completed_at: None,
            error_message: None,
        };
        self.dispatches.lock().insert(dispatch_id, record);
        debug!(dispatch_id = %dispatch_id, "Started tracking dispatch");
    }

    /// Record a channel's outcome. Later reports for the same channel replace earlier ones.
    pub fn update_channel_status(
        &self,
        dispatch_id: Uuid,
        channel: &str,
        success: bool,
        error_message: Option<String>,
    ) {
        let mut dispatches = self.dispatches.lock();
        let Some(record) = dispatches.get_mut(&dispatch_id) else {
            debug!(dispatch_id = %dispatch_id, channel, "Status update for unknown dispatch");
            return;
        };

        record.channels.insert(
            channel.to_string(),
            ChannelOutcome {
                success,
                timestamp: Utc::now(),
                error_message,
            },
        );
        debug!(dispatch_id = %dispatch_id, channel, success, "Updated channel status");
    }

    /// Finalize a pending dispatch as completed.
    ///
    /// Returns `false` if the dispatch is unknown or already finalized.
    pub fn mark_completed(&self, dispatch_id: Uuid) -> bool {
        let mut dispatches = self.dispatches.lock();
        let Some(record) = dispatches.get_mut(&dispatch_id) else {
            return false;
        };
        if record.status != DispatchStatus::Pending {
            return false;
        }

        let overall_success = record.channels.values().any(|c| c.success);
        record.status = DispatchStatus::Completed;
        record.completed_at = Some(Utc::now());
        record.overall_success = Some(overall_success);

        debug!(
            dispatch_id = %dispatch_id,
            channels = record.channels.len(),
            overall_success,
            "Marked dispatch as completed"
        );
        true
    }

    /// Finalize a pending dispatch as failed.
    pub fn mark_failed(&self, dispatch_id: Uuid, error_message: impl Into<String>) -> bool {
        let error_message = error_message.into();
        let mut dispatches = self.dispatches.lock();
        let Some(record) = dispatches.get_mut(&dispatch_id) else {
            return false;
        };
        if record.status != DispatchStatus::Pending {
            return false;
        }

        record.status = DispatchStatus::Failed;
        record.completed_at = Some(Utc::now());
        record.overall_success = Some(false);
        error!(dispatch_id = %dispatch_id, "Marked dispatch as failed: {}", error_message);
        record.error_message = Some(error_message);
        true
    }

    pub fn get_status(&self, dispatch_id: Uuid) -> Option<DispatchRecord> {
        self.dispatches.lock().get(&dispatch_id).cloned()
    }

    pub fn stats(&self) -> DeliveryStats {
        let dispatches = self.dispatches.lock();
        let total = dispatches.len();
        let count = |status| dispatches.values().filter(|d| d.status == status).count();
        let completed = count(DispatchStatus::Completed);
        let failed = count(DispatchStatus::Failed);

        DeliveryStats {
            total_dispatches: total,
            completed,
            failed,
            pending: total - completed - failed,
            success_rate: if total > 0 {
                completed as f64 / total as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    /// Drop records created more than `max_age` ago. Returns the number removed.
    pub fn cleanup_older_than(&self, max_age: Duration) -> usize {
        self.cleanup_older_than_at(max_age, Utc::now())
    }

    pub fn cleanup_older_than_at(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        let Some(cutoff) = now.checked_sub_signed(max_age) else {
            return 0;
        };

        let mut dispatches = self.dispatches.lock();
        let before = dispatches.len();
        dispatches.retain(|_, d| d.created_at >= cutoff);
        let removed = before - dispatches.len();

        if removed > 0 {
            info!(removed, "Cleaned up old dispatch records");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.dispatches.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(tracker: &DeliveryTracker) -> Uuid {
        let id = Uuid::new_v4();
        tracker.start_tracking(id, Payload::new());
        id
    }

    #[test]
    fn test_partial_success_counts_as_success() {
        let tracker = DeliveryTracker::new();
        let id = tracked(&tracker);

        tracker.update_channel_status(id, "email", true, None);
        tracker.update_channel_status(id, "notification", false, Some("timed out".to_string()));
        assert!(tracker.mark_completed(id));

        let record = tracker.get_status(id).unwrap();
        assert_eq!(record.status, DispatchStatus::Completed);
        assert_eq!(record.overall_success, Some(true));
        assert_eq!(record.channels.len(), 2);
        assert_eq!(
            record.channels["notification"].error_message.as_deref(),
            Some("timed out")
        );
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_all_channels_failed() {
        let tracker = DeliveryTracker::new();
        let id = tracked(&tracker);

        tracker.update_channel_status(id, "email", false, None);
        tracker.mark_completed(id);
        assert_eq!(tracker.get_status(id).unwrap().overall_success, Some(false));
    }

    #[test]
    fn test_update_channel_status_last_write_wins() {
        let tracker = DeliveryTracker::new();
        let id = tracked(&tracker);

        tracker.update_channel_status(id, "email", false, Some("first".to_string()));
        tracker.update_channel_status(id, "email", true, None);

        let record = tracker.get_status(id).unwrap();
        assert_eq!(record.channels.len(), 1);
        assert!(record.channels["email"].success);
        assert!(record.channels["email"].error_message.is_none());
    }

    #[test]
    fn test_finalized_exactly_once() {
        let tracker = DeliveryTracker::new();
        let id = tracked(&tracker);

        assert!(tracker.mark_failed(id, "no active notification channels"));
        assert!(!tracker.mark_completed(id));
        assert!(!tracker.mark_failed(id, "again"));

        let record = tracker.get_status(id).unwrap();
        assert_eq!(record.status, DispatchStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("no active notification channels"));
    }

    #[test]
    fn test_unknown_dispatch() {
        let tracker = DeliveryTracker::new();
        let id = Uuid::new_v4();
        tracker.update_channel_status(id, "email", true, None);
        assert!(!tracker.mark_completed(id));
        assert!(tracker.get_status(id).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_stats() {
        let tracker = DeliveryTracker::new();
        assert_eq!(tracker.stats().success_rate, 0.0);

        let a = tracked(&tracker);
        let b = tracked(&tracker);
        let _c = tracked(&tracker);
        let d = tracked(&tracker);
        tracker.mark_completed(a);
        tracker.mark_completed(b);
        tracker.mark_failed(d, "boom");

        let stats = tracker.stats();
        assert_eq!(stats.total_dispatches, 4);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.success_rate, 50.0);
    }

    #[test]
    fn test_cleanup_older_than() {
        let tracker = DeliveryTracker::new();
        let now = Utc::now();
        tracker.start_tracking_at(Uuid::new_v4(), Payload::new(), now - TimeDelta::hours(30));
        tracker.start_tracking_at(Uuid::new_v4(), Payload::new(), now - TimeDelta::hours(2));

        let removed = tracker.cleanup_older_than_at(Duration::from_secs(24 * 3600), now);
        assert_eq!(removed, 1);
        assert_eq!(tracker.len(), 1);
    }
}
