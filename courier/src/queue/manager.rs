//! Registry of named queues and their processors.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::priority_queue::{DEFAULT_DEAD_LETTER_CAPACITY, PriorityQueue, QueueStats, QueueTask};
use super::processor::{ProcessorConfig, ProcessorStats, QueueProcessor, TaskHandler};
use crate::rate_limit::RateLimiter;
use crate::{Error, Result};

/// Snapshot of every queue and processor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ManagerStats {
    pub queues: Vec<QueueStats>,
    pub processors: Vec<ProcessorStats>,
}

/// Owns the named queues and the worker pools draining them.
pub struct QueueManager {
    queues: DashMap<String, Arc<PriorityQueue>>,
    processors: DashMap<String, Arc<QueueProcessor>>,
    dead_letter_capacity: usize,
}

impl QueueManager {
    pub fn new() -> Self {
        Self::with_dead_letter_capacity(DEFAULT_DEAD_LETTER_CAPACITY)
    }

    pub fn with_dead_letter_capacity(dead_letter_capacity: usize) -> Self {
        Self {
            queues: DashMap::new(),
            processors: DashMap::new(),
            dead_letter_capacity,
        }
    }

    /// Create a queue, or return the existing one with that name.
    pub fn create_queue(&self, name: &str) -> Arc<PriorityQueue> {
        match self.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                info!(queue = %name, "Created queue");
                let queue = Arc::new(PriorityQueue::with_dead_letter_capacity(
                    name,
                    self.dead_letter_capacity,
                ));
                entry.insert(queue.clone());
                queue
            }
        }
    }

    pub fn get_queue(&self, name: &str) -> Option<Arc<PriorityQueue>> {
        self.queues.get(name).map(|q| q.clone())
    }

    /// Create a processor draining `queue_name`.
    ///
    /// Returns the existing processor if one is already registered under
    /// `name`; fails if the queue does not exist.
    pub fn create_processor(
        &self,
        name: &str,
        queue_name: &str,
        handler: Arc<dyn TaskHandler>,
        config: ProcessorConfig,
        limiter: Option<Arc<RateLimiter>>,
    ) -> Result<Arc<QueueProcessor>> {
        let queue = self
            .get_queue(queue_name)
            .ok_or_else(|| Error::not_found("queue", queue_name))?;

        let processor = match self.processors.entry(name.to_string()) {
            Entry::Occupied(entry) => {
                debug!(processor = %name, "Processor already exists");
                entry.get().clone()
            }
            Entry::Vacant(entry) => {
                let mut processor = QueueProcessor::new(name, queue, handler, config);
                if let Some(limiter) = limiter {
                    processor = processor.with_rate_limiter(limiter);
                }
                let processor = Arc::new(processor);
                entry.insert(processor.clone());
                info!(processor = %name, queue = %queue_name, "Created queue processor");
                processor
            }
        };
        Ok(processor)
    }

    pub fn get_processor(&self, name: &str) -> Option<Arc<QueueProcessor>> {
        self.processors.get(name).map(|p| p.clone())
    }

    /// Unregister a processor so a fresh one can be created under its name.
    ///
    /// The caller is responsible for stopping it.
    pub fn remove_processor(&self, name: &str) -> Option<Arc<QueueProcessor>> {
        self.processors.remove(name).map(|(_, p)| p)
    }

    /// Add a task to a named queue. Returns `false` if the queue does not exist.
    pub fn enqueue(&self, queue_name: &str, task: QueueTask) -> bool {
        match self.get_queue(queue_name) {
            Some(queue) => {
                queue.add(task);
                true
            }
            None => {
                warn!(queue = %queue_name, task_id = %task.id(), "Enqueue to unknown queue");
                false
            }
        }
    }

    pub fn start_all(&self) {
        for processor in self.processor_list() {
            processor.start();
        }
        info!(processors = self.processors.len(), "Started all queue processors");
    }

    pub async fn stop_all(&self) {
        for processor in self.processor_list() {
            processor.stop().await;
        }
        info!("Stopped all queue processors");
    }

    /// Re-inject dead letters of every queue. Returns the total re-queued.
    pub fn requeue_all_dead_letters(&self) -> usize {
        self.queue_list()
            .iter()
            .map(|queue| queue.requeue_dead_letters())
            .sum()
    }

    pub fn all_stats(&self) -> ManagerStats {
        let mut queues: Vec<QueueStats> = self.queue_list().iter().map(|q| q.stats()).collect();
        queues.sort_by(|a, b| a.name.cmp(&b.name));

        let mut processors: Vec<ProcessorStats> =
            self.processor_list().iter().map(|p| p.stats()).collect();
        processors.sort_by(|a, b| a.name.cmp(&b.name));

        ManagerStats { queues, processors }
    }

    // Clone out of the map so no shard lock is held across an await.
    fn processor_list(&self) -> Vec<Arc<QueueProcessor>> {
        self.processors.iter().map(|p| p.value().clone()).collect()
    }

    fn queue_list(&self) -> Vec<Arc<PriorityQueue>> {
        self.queues.iter().map(|q| q.value().clone()).collect()
    }
}

impl Default for QueueManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::task::{NotificationTask, Payload};
    use crate::queue::processor::handler_fn;
    use std::time::Duration;

    fn task() -> QueueTask {
        QueueTask::new(
            NotificationTask::new("test", "user", Payload::new()),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_create_queue_is_idempotent() {
        let manager = QueueManager::new();
        let a = manager.create_queue("emails");
        let b = manager.create_queue("emails");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_enqueue_unknown_queue() {
        let manager = QueueManager::new();
        assert!(!manager.enqueue("missing", task()));

        manager.create_queue("emails");
        assert!(manager.enqueue("emails", task()));
        assert_eq!(manager.get_queue("emails").unwrap().len(), 1);
    }

    #[test]
    fn test_create_processor_requires_queue() {
        let manager = QueueManager::new();
        let handler = handler_fn(|_task| async { Ok(true) });

        let result = manager.create_processor(
            "emails",
            "missing",
            handler,
            ProcessorConfig::default(),
            None,
        );
        assert!(matches!(result, Err(Error::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_start_stop_all_and_stats() {
        let manager = QueueManager::new();
        manager.create_queue("emails");
        manager.create_queue("notifications");

        let handler = handler_fn(|_task| async { Ok(true) });
        let first = manager
            .create_processor("emails", "emails", handler.clone(), ProcessorConfig::default(), None)
            .unwrap();
        let second = manager
            .create_processor("emails", "emails", handler, ProcessorConfig::default(), None)
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        manager.start_all();
        assert!(first.is_running());

        let stats = manager.all_stats();
        assert_eq!(stats.queues.len(), 2);
        assert_eq!(stats.queues[0].name, "emails");
        assert_eq!(stats.processors.len(), 1);
        assert!(stats.processors[0].running);

        manager.stop_all().await;
        assert!(!first.is_running());
    }
}
