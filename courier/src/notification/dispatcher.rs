//! Multi-channel fan-out.
//!
//! The dispatcher builds one task per active channel for each event, sends
//! them concurrently and lets a separate aggregation task record every
//! channel's outcome before finalizing the dispatch record.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::channels::{ChannelHealth, ChannelService};
use super::registry::ServiceRegistry;
use super::task::Payload;
use super::tracker::{DeliveryStats, DeliveryTracker, DispatchRecord};
use crate::Result;

/// Default per-channel completion timeout.
pub const DEFAULT_COMPLETION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherStats {
    pub active_services: usize,
    pub total_services: usize,
    pub delivery_stats: DeliveryStats,
    /// Fan-out and aggregation tasks still running.
    pub in_flight_tasks: usize,
}

pub struct Dispatcher {
    registry: Arc<ServiceRegistry>,
    tracker: Arc<DeliveryTracker>,
    completion_timeout: Duration,
    tasks: TaskTracker,
}

impl Dispatcher {
    pub fn new(registry: Arc<ServiceRegistry>, tracker: Arc<DeliveryTracker>) -> Self {
        Self {
            registry,
            tracker,
            completion_timeout: DEFAULT_COMPLETION_TIMEOUT,
            tasks: TaskTracker::new(),
        }
    }

    /// How long the aggregator waits for each channel.
    pub fn with_completion_timeout(mut self, timeout: Duration) -> Self {
        self.completion_timeout = timeout;
        self
    }

    /// Fan an event out to every active channel.
    ///
    /// Returns immediately with the dispatch id; progress is visible through
    /// [`get_dispatch_status`](Self::get_dispatch_status).
    pub fn dispatch_event(&self, payload: Payload) -> Uuid {
        let targets = self.registry.active_services();
        self.fan_out(targets, payload)
    }

    /// Fan an event out to the named channels only.
    ///
    /// Unknown or inactive names are skipped.
    pub fn dispatch_to<S: AsRef<str>>(&self, channels: &[S], payload: Payload) -> Uuid {
        let targets = self
            .registry
            .active_services()
            .into_iter()
            .filter(|s| channels.iter().any(|c| c.as_ref() == s.name()))
            .collect();
        self.fan_out(targets, payload)
    }

    pub fn get_dispatch_status(&self, dispatch_id: Uuid) -> Option<DispatchRecord> {
        self.tracker.get_status(dispatch_id)
    }

    pub fn tracker(&self) -> &Arc<DeliveryTracker> {
        &self.tracker
    }

    pub async fn service_health(&self) -> BTreeMap<String, ChannelHealth> {
        self.registry.health_check_all().await
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            active_services: self.registry.active_services().len(),
            total_services: self.registry.len(),
            delivery_stats: self.tracker.stats(),
            in_flight_tasks: self.tasks.len(),
        }
    }

    /// Stop accepting new work and wait for in-flight aggregations.
    pub async fn shutdown(&self, timeout: Duration) {
        self.tasks.close();
        if tokio::time::timeout(timeout, self.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Dispatcher shutdown timed out with tasks still running"
            );
        }
    }

    fn fan_out(&self, targets: Vec<Arc<dyn ChannelService>>, payload: Payload) -> Uuid {
        let dispatch_id = Uuid::new_v4();
        self.tracker.start_tracking(dispatch_id, payload.clone());

        if targets.is_empty() {
            self.tracker
                .mark_failed(dispatch_id, "no active notification channels");
            return dispatch_id;
        }

        info!(
            dispatch_id = %dispatch_id,
            channels = targets.len(),
            "Dispatching notification"
        );

        let sends: Vec<_> = targets
            .into_iter()
            .map(|service| {
                let name = service.name().to_string();
                let handle = self.tasks.spawn(send_to_channel(service, payload.clone()));
                (name, handle)
            })
            .collect();

        let tracker = self.tracker.clone();
        let timeout = self.completion_timeout;
        self.tasks.spawn(async move {
            let waits = sends.into_iter().map(|(channel, handle)| {
                let tracker = tracker.clone();
                async move {
                    let (success, error) = match tokio::time::timeout(timeout, handle).await {
                        Ok(Ok(Ok(true))) => (true, None),
                        Ok(Ok(Ok(false))) => (false, Some("delivery failed".to_string())),
                        Ok(Ok(Err(e))) => (false, Some(e.to_string())),
                        Ok(Err(e)) => (false, Some(format!("send task aborted: {}", e))),
                        Err(_) => (
                            false,
                            Some(format!("timed out after {}s", timeout.as_secs())),
                        ),
                    };
                    if let Some(error) = &error {
                        warn!(dispatch_id = %dispatch_id, channel = %channel, "Channel failed: {}", error);
                    }
                    tracker.update_channel_status(dispatch_id, &channel, success, error);
                }
            });
            join_all(waits).await;

            if tracker.mark_completed(dispatch_id) {
                info!(dispatch_id = %dispatch_id, "Dispatch completed");
            }
        });

        dispatch_id
    }
}

async fn send_to_channel(service: Arc<dyn ChannelService>, event: Payload) -> Result<bool> {
    let task = service.task_for_event(&event)?;
    debug!(channel = %service.name(), task_id = %task.id(), "Sending to channel");
    service.send_notification(task).await
}
