//! Application context.
//!
//! The AppContext builds every notification component from a
//! [`CourierConfig`] and manages their lifecycle.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CourierConfig;
use crate::notification::channels::transport::{EmailTransport, PushTransport};
use crate::notification::channels::{EmailChannel, PushChannel};
use crate::notification::{DeliveryTracker, Dispatcher, DispatcherStats, ServiceRegistry};
use crate::queue::{ManagerStats, QueueManager};
use crate::Result;

/// Results of one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenanceReport {
    pub expired_dispatches: usize,
    pub pruned_rate_limits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextStats {
    pub dispatcher: DispatcherStats,
    pub queues: ManagerStats,
}

/// Owns the queues, channels, registry, tracker and dispatcher.
pub struct AppContext {
    pub config: CourierConfig,
    pub queues: Arc<QueueManager>,
    pub registry: Arc<ServiceRegistry>,
    pub tracker: Arc<DeliveryTracker>,
    pub dispatcher: Arc<Dispatcher>,
    pub email: Arc<EmailChannel>,
    pub push: Arc<PushChannel>,
    started: AtomicBool,
    /// Cancels background maintenance.
    cancellation_token: CancellationToken,
}

impl AppContext {
    /// Build the context with transports chosen from the configuration.
    pub fn new(config: CourierConfig) -> Result<Self> {
        Self::build(config, None, None)
    }

    /// Build the context with explicit channel transports.
    pub fn with_transports(
        config: CourierConfig,
        email_transport: Arc<dyn EmailTransport>,
        push_transport: Arc<dyn PushTransport>,
    ) -> Result<Self> {
        Self::build(config, Some(email_transport), Some(push_transport))
    }

    fn build(
        config: CourierConfig,
        email_transport: Option<Arc<dyn EmailTransport>>,
        push_transport: Option<Arc<dyn PushTransport>>,
    ) -> Result<Self> {
        config.validate()?;
        info!("Initializing application context");

        let queues = Arc::new(QueueManager::with_dead_letter_capacity(
            config.dead_letter_capacity,
        ));

        let mut email = EmailChannel::new(
            config.email.clone(),
            config.email_rate_limits(),
            config.lane_options(),
            queues.clone(),
        );
        if let Some(transport) = email_transport {
            email = email.with_transport(transport);
        }
        let email = Arc::new(email);

        let mut push = PushChannel::new(
            config.push.clone(),
            config.max_notifications_per_recipient_per_hour,
            config.lane_options(),
            queues.clone(),
        );
        if let Some(transport) = push_transport {
            push = push.with_transport(transport);
        }
        let push = Arc::new(push);

        let registry = Arc::new(ServiceRegistry::new());
        registry.register(email.clone())?;
        registry.register(push.clone())?;

        let tracker = Arc::new(DeliveryTracker::new());
        let dispatcher = Arc::new(
            Dispatcher::new(registry.clone(), tracker.clone())
                .with_completion_timeout(config.dispatch_completion_timeout()),
        );

        info!(services = registry.len(), "Application context initialized");

        Ok(Self {
            config,
            queues,
            registry,
            tracker,
            dispatcher,
            email,
            push,
            started: AtomicBool::new(false),
            cancellation_token: CancellationToken::new(),
        })
    }

    /// Start every channel and the background maintenance.
    ///
    /// Returns whether each channel started. Calling it again only restarts
    /// channels; maintenance is spawned once.
    pub async fn start(&self) -> BTreeMap<String, bool> {
        let results = self.registry.start_all().await;

        if !self.started.swap(true, Ordering::SeqCst) {
            self.spawn_maintenance();
            self.spawn_dead_letter_sweep();
        }

        let started = results.values().filter(|ok| **ok).count();
        info!(started, total = results.len(), "Services started");
        results
    }

    /// Stop maintenance, drain dispatches, then stop channels and workers.
    pub async fn shutdown(&self) -> Result<()> {
        let timeout = self.config.shutdown_timeout();
        info!("Shutting down (timeout: {:?})", timeout);

        self.cancellation_token.cancel();

        // Pending dispatches still need running workers to finish.
        self.dispatcher.shutdown(timeout).await;

        let stopped = self.registry.stop_all().await;
        for (service, ok) in &stopped {
            if !ok {
                warn!(service = %service, "Service did not stop cleanly");
            }
        }

        self.queues.stop_all().await;

        info!("Shutdown complete");
        Ok(())
    }

    /// Run one maintenance pass now.
    pub fn run_maintenance(&self) -> MaintenanceReport {
        maintenance_pass(&self.tracker, &self.push, self.config.dispatch_retention())
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn stats(&self) -> ContextStats {
        ContextStats {
            dispatcher: self.dispatcher.stats(),
            queues: self.queues.all_stats(),
        }
    }

    fn spawn_maintenance(&self) {
        let tracker = self.tracker.clone();
        let push = self.push.clone();
        let retention = self.config.dispatch_retention();
        let interval = Duration::from_secs(self.config.maintenance_interval_seconds);
        let cancellation_token = self.cancellation_token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Maintenance task shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        maintenance_pass(&tracker, &push, retention);
                    }
                }
            }
        });
    }

    fn spawn_dead_letter_sweep(&self) {
        let Some(secs) = self.config.dead_letter_requeue_interval_seconds else {
            return;
        };
        let interval = Duration::from_secs(secs);
        let queues = self.queues.clone();
        let cancellation_token = self.cancellation_token.clone();

        info!(interval_secs = secs, "Dead-letter requeue sweep enabled");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        debug!("Dead-letter sweep shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        let requeued = queues.requeue_all_dead_letters();
                        if requeued > 0 {
                            info!(requeued, "Requeued dead-lettered tasks");
                        }
                    }
                }
            }
        });
    }
}

fn maintenance_pass(
    tracker: &DeliveryTracker,
    push: &PushChannel,
    retention: Duration,
) -> MaintenanceReport {
    let report = MaintenanceReport {
        expired_dispatches: tracker.cleanup_older_than(retention),
        pruned_rate_limits: push.prune_rate_limits(),
    };
    debug!(?report, "Maintenance pass finished");
    report
}
