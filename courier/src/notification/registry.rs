//! Channel service registry.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tracing::{error, info, warn};

use super::channels::{ChannelHealth, ChannelService, ChannelStatus};
use crate::{Error, Result};

/// Holds the channel services and drives their lifecycle.
#[derive(Default)]
pub struct ServiceRegistry {
    services: DashMap<String, Arc<dyn ChannelService>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its name. Duplicate names are rejected.
    pub fn register(&self, service: Arc<dyn ChannelService>) -> Result<()> {
        let name = service.name().to_string();
        match self.services.entry(name.clone()) {
            Entry::Occupied(_) => Err(Error::already_exists("service", name)),
            Entry::Vacant(entry) => {
                entry.insert(service);
                info!(service = %name, "Registered service");
                Ok(())
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelService>> {
        self.services.get(name).map(|s| s.value().clone())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    /// Services whose status is currently `active`, ordered by name.
    pub fn active_services(&self) -> Vec<Arc<dyn ChannelService>> {
        self.all()
            .into_iter()
            .filter(|s| s.status() == ChannelStatus::Active)
            .collect()
    }

    /// Start every service. One failure does not prevent the others from starting.
    pub async fn start_all(&self) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for service in self.all() {
            let name = service.name().to_string();
            let started = match AssertUnwindSafe(service.start()).catch_unwind().await {
                Ok(started) => started,
                Err(_) => {
                    error!(service = %name, "Service panicked while starting");
                    service.state().set_status(ChannelStatus::Error);
                    false
                }
            };
            if !started {
                warn!(service = %name, "Service failed to start");
            }
            results.insert(name, started);
        }
        results
    }

    /// Stop every service. One failure does not prevent the others from stopping.
    pub async fn stop_all(&self) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for service in self.all() {
            let name = service.name().to_string();
            let stopped = match AssertUnwindSafe(service.stop()).catch_unwind().await {
                Ok(stopped) => stopped,
                Err(_) => {
                    error!(service = %name, "Service panicked while stopping");
                    service.state().set_status(ChannelStatus::Error);
                    false
                }
            };
            results.insert(name, stopped);
        }
        results
    }

    /// Check every service, converting errors and panics into error reports.
    pub async fn health_check_all(&self) -> BTreeMap<String, ChannelHealth> {
        let mut report = BTreeMap::new();
        for service in self.all() {
            let name = service.name().to_string();
            let health = match AssertUnwindSafe(service.health_check()).catch_unwind().await {
                Ok(Ok(health)) => health,
                Ok(Err(e)) => {
                    warn!(service = %name, "Health check failed: {}", e);
                    ChannelHealth::from_error(&e)
                }
                Err(_) => {
                    error!(service = %name, "Health check panicked");
                    ChannelHealth::from_error(&Error::Other("health check panicked".to_string()))
                }
            };
            report.insert(name, health);
        }
        report
    }

    // Snapshot so no shard lock is held across an await.
    fn all(&self) -> Vec<Arc<dyn ChannelService>> {
        let mut services: Vec<_> = self.services.iter().map(|s| s.value().clone()).collect();
        services.sort_by(|a, b| a.name().cmp(b.name()));
        services
    }
}
