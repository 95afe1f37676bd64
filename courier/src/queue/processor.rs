//! Worker pool draining one priority queue.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::priority_queue::{PriorityQueue, QueueTask};
use crate::Result;
use crate::notification::task::NotificationTask;
use crate::rate_limit::{Admission, RateLimiter};

/// Channel-specific delivery function.
///
/// `Ok(true)` means delivered. `Ok(false)`, an error, a timeout or a panic
/// all count as a failed attempt.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn deliver(&self, task: &NotificationTask) -> Result<bool>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> TaskHandler for FnHandler<F>
where
    F: Fn(NotificationTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    async fn deliver(&self, task: &NotificationTask) -> Result<bool> {
        (self.0)(task.clone()).await
    }
}

/// Wrap an async closure as a [`TaskHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn TaskHandler>
where
    F: Fn(NotificationTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Configuration for a queue processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Number of concurrent workers.
    pub max_workers: usize,
    /// Idle poll interval in milliseconds.
    pub poll_interval_ms: u64,
    /// Per-delivery timeout in seconds.
    pub delivery_timeout_secs: u64,
    /// How long `stop` waits for in-flight deliveries before aborting.
    pub shutdown_timeout_secs: u64,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            poll_interval_ms: 1000,
            delivery_timeout_secs: 60,
            shutdown_timeout_secs: 5,
        }
    }
}

/// Snapshot of a processor's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorStats {
    pub name: String,
    pub queue: String,
    pub workers: usize,
    pub running: bool,
    pub in_flight: usize,
}

/// A fixed-size worker pool bound to one queue and one delivery function.
pub struct QueueProcessor {
    name: String,
    queue: Arc<PriorityQueue>,
    handler: Arc<dyn TaskHandler>,
    limiter: Option<Arc<RateLimiter>>,
    config: ProcessorConfig,
    running: AtomicBool,
    in_flight: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl QueueProcessor {
    pub fn new(
        name: impl Into<String>,
        queue: Arc<PriorityQueue>,
        handler: Arc<dyn TaskHandler>,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            handler,
            limiter: None,
            config,
            running: AtomicBool::new(false),
            in_flight: Arc::new(AtomicUsize::new(0)),
            cancellation_token: CancellationToken::new(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Gate every delivery attempt on `limiter`.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    /// Spawn the worker loops. Calling this twice has no effect.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!(processor = %self.name, "Processor already running");
            return;
        }

        let mut tasks = self.tasks.lock();
        let Some(join_set) = tasks.as_mut() else {
            self.running.store(false, Ordering::SeqCst);
            warn!(processor = %self.name, "Processor was stopped and cannot be restarted");
            return;
        };

        info!(
            processor = %self.name,
            queue = %self.queue.name(),
            workers = self.config.max_workers,
            "Starting queue processor"
        );

        for worker_id in 0..self.config.max_workers {
            let worker = Worker {
                id: worker_id,
                processor: self.name.clone(),
                queue: self.queue.clone(),
                handler: self.handler.clone(),
                limiter: self.limiter.clone(),
                in_flight: self.in_flight.clone(),
                cancellation_token: self.cancellation_token.clone(),
                poll_interval: Duration::from_millis(self.config.poll_interval_ms),
                delivery_timeout: Duration::from_secs(self.config.delivery_timeout_secs),
            };
            join_set.spawn(worker.run());
        }
    }

    /// Signal workers to exit after their current task and wait for them.
    ///
    /// Workers still busy after the shutdown timeout are aborted.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(processor = %self.name, "Stopping queue processor");
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            let shutdown_timeout = Duration::from_secs(self.config.shutdown_timeout_secs);
            let drained = tokio::time::timeout(shutdown_timeout, async {
                while join_set.join_next().await.is_some() {}
            })
            .await;

            if drained.is_err() {
                warn!(
                    processor = %self.name,
                    timeout = ?shutdown_timeout,
                    "Workers did not finish in time, aborting"
                );
                join_set.abort_all();
                while join_set.join_next().await.is_some() {}
            }
        }

        info!(processor = %self.name, "Queue processor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of deliveries currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ProcessorStats {
        ProcessorStats {
            name: self.name.clone(),
            queue: self.queue.name().to_string(),
            workers: self.config.max_workers,
            running: self.is_running(),
            in_flight: self.in_flight(),
        }
    }
}

struct Worker {
    id: usize,
    processor: String,
    queue: Arc<PriorityQueue>,
    handler: Arc<dyn TaskHandler>,
    limiter: Option<Arc<RateLimiter>>,
    in_flight: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    poll_interval: Duration,
    delivery_timeout: Duration,
}

impl Worker {
    async fn run(self) {
        debug!(processor = %self.processor, worker = self.id, "Worker started");
        let notifier = self.queue.notifier();

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let Some(task) = self.queue.get_next() else {
                tokio::select! {
                    _ = self.cancellation_token.cancelled() => break,
                    _ = notifier.notified() => {}
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
                continue;
            };

            if let Some(limiter) = &self.limiter {
                if let Admission::Denied {
                    reason,
                    retry_after,
                } = limiter.try_admit()
                {
                    debug!(
                        processor = %self.processor,
                        task_id = %task.id(),
                        retry_after = ?retry_after,
                        "Delivery deferred: {}",
                        reason
                    );
                    self.queue.defer(task);
                    tokio::select! {
                        _ = self.cancellation_token.cancelled() => break,
                        _ = tokio::time::sleep(retry_after.min(self.poll_interval)) => {}
                    }
                    continue;
                }
            }

            self.process(task).await;
        }

        debug!(processor = %self.processor, worker = self.id, "Worker shutting down");
    }

    async fn process(&self, mut task: QueueTask) {
        if let Err(e) = task.task.begin_attempt() {
            error!(
                processor = %self.processor,
                task_id = %task.id(),
                "Dropping task in unexpected state: {}",
                e
            );
            return;
        }

        debug!(
            processor = %self.processor,
            worker = self.id,
            task_id = %task.id(),
            attempt = task.task.retry_count() + 1,
            "Delivering task"
        );

        let snapshot = task.task.clone();
        let mut attempt = Attempt::begin(self, task);

        let handler = self.handler.clone();
        let mut delivery = tokio::spawn(async move { handler.deliver(&snapshot).await });
        attempt.delivery = Some(delivery.abort_handle());

        let failure = match tokio::time::timeout(self.delivery_timeout, &mut delivery).await {
            Ok(Ok(Ok(true))) => None,
            Ok(Ok(Ok(false))) => Some("delivery reported failure".to_string()),
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(join_error)) => Some(format!("delivery aborted: {}", join_error)),
            Err(_) => {
                delivery.abort();
                Some(format!(
                    "delivery timed out after {}s",
                    self.delivery_timeout.as_secs()
                ))
            }
        };

        let Some(task) = attempt.finish() else {
            return;
        };

        match failure {
            None => self.queue.mark_processed(task),
            Some(error) => {
                warn!(
                    processor = %self.processor,
                    task_id = %task.id(),
                    "Delivery attempt failed: {}",
                    error
                );
                self.queue.mark_failed(task, &error);
            }
        }
    }
}

/// One delivery attempt in progress.
///
/// Counts toward `in_flight` while alive. If the worker is dropped before the
/// attempt finishes, the held task is failed back into its queue and the
/// detached delivery is aborted.
struct Attempt<'a> {
    processor: &'a str,
    queue: &'a PriorityQueue,
    in_flight: &'a AtomicUsize,
    task: Option<QueueTask>,
    delivery: Option<AbortHandle>,
}

impl<'a> Attempt<'a> {
    fn begin(worker: &'a Worker, task: QueueTask) -> Self {
        worker.in_flight.fetch_add(1, Ordering::SeqCst);
        Self {
            processor: &worker.processor,
            queue: &worker.queue,
            in_flight: &worker.in_flight,
            task: Some(task),
            delivery: None,
        }
    }

    /// Release the task once its outcome is known.
    fn finish(mut self) -> Option<QueueTask> {
        self.delivery = None;
        self.task.take()
    }
}

impl Drop for Attempt<'_> {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let Some(task) = self.task.take() else {
            return;
        };
        if let Some(delivery) = self.delivery.take() {
            delivery.abort();
        }
        warn!(
            processor = %self.processor,
            task_id = %task.id(),
            "Delivery interrupted before completion"
        );
        self.queue.mark_failed(task, "delivery interrupted by shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Error;
    use crate::notification::task::Payload;
    use crate::queue::priority_queue::TaskOutcome;
    use crate::rate_limit::RateLimitConfig;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::oneshot;

    fn fast_config(workers: usize) -> ProcessorConfig {
        ProcessorConfig {
            max_workers: workers,
            poll_interval_ms: 10,
            delivery_timeout_secs: 1,
            shutdown_timeout_secs: 1,
        }
    }

    fn submit(queue: &PriorityQueue, recipient: &str, max_retries: u32) -> oneshot::Receiver<TaskOutcome> {
        let task = NotificationTask::new("test", recipient, Payload::new()).with_max_retries(max_retries);
        let (task, rx) = QueueTask::new(task, Duration::ZERO).with_completion();
        queue.add(task);
        rx
    }

    async fn outcome(rx: oneshot::Receiver<TaskOutcome>) -> TaskOutcome {
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .expect("task did not complete in time")
            .expect("completion sender dropped")
    }

    #[test]
    fn test_processor_config_default() {
        let config = ProcessorConfig::default();
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.delivery_timeout_secs, 60);
    }

    #[tokio::test]
    async fn test_processor_delivers_tasks() {
        let queue = Arc::new(PriorityQueue::new("test"));
        let delivered = Arc::new(AtomicU32::new(0));
        let counter = delivered.clone();
        let handler = handler_fn(move |_task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(true)
            }
        });

        let processor = QueueProcessor::new("test", queue.clone(), handler, fast_config(2));
        let receivers: Vec<_> = (0..5).map(|i| submit(&queue, &format!("user-{i}"), 3)).collect();
        processor.start();

        for rx in receivers {
            assert!(outcome(rx).await.success);
        }
        processor.stop().await;

        assert_eq!(delivered.load(Ordering::SeqCst), 5);
        assert_eq!(queue.stats().metrics.total_processed, 5);
        assert!(!processor.is_running());
    }

    #[tokio::test]
    async fn test_failures_retry_then_dead_letter() {
        let queue = Arc::new(PriorityQueue::new("test"));
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();
        let handler = handler_fn(move |_task| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::delivery("smtp unavailable"))
            }
        });

        let processor = QueueProcessor::new("test", queue.clone(), handler, fast_config(1));
        let rx = submit(&queue, "user", 2);
        processor.start();

        let result = outcome(rx).await;
        processor.stop().await;

        assert!(!result.success);
        assert_eq!(result.retries, 2);
        assert!(result.error.unwrap().contains("smtp unavailable"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(queue.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_kill_worker() {
        let queue = Arc::new(PriorityQueue::new("test"));
        let handler = handler_fn(|task: NotificationTask| async move {
            if task.recipient == "boom" {
                panic!("handler exploded");
            }
            Ok(true)
        });

        let processor = QueueProcessor::new("test", queue.clone(), handler, fast_config(1));
        let bad = submit(&queue, "boom", 0);
        let good = submit(&queue, "fine", 0);
        processor.start();

        assert!(!outcome(bad).await.success);
        assert!(outcome(good).await.success);
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_slow_delivery_times_out() {
        let queue = Arc::new(PriorityQueue::new("test"));
        let handler = handler_fn(|_task| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(true)
        });

        let processor = QueueProcessor::new("test", queue.clone(), handler, fast_config(1));
        let rx = submit(&queue, "user", 0);
        processor.start();

        let result = outcome(rx).await;
        processor.stop().await;

        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_stop_timeout_returns_held_tasks_to_queue() {
        let queue = Arc::new(PriorityQueue::new("test"));
        let handler = handler_fn(|_task| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(true)
        });
        let config = ProcessorConfig {
            delivery_timeout_secs: 60,
            shutdown_timeout_secs: 0,
            ..fast_config(2)
        };

        let processor = QueueProcessor::new("test", queue.clone(), handler, config);
        let _retryable = submit(&queue, "retryable", 1);
        let exhausted = submit(&queue, "exhausted", 0);
        processor.start();

        for _ in 0..100 {
            if processor.in_flight() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(processor.in_flight(), 2);

        processor.stop().await;
        assert_eq!(processor.in_flight(), 0);
        assert_eq!(processor.stats().in_flight, 0);

        // One attempt left: back in the retry lane.
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().metrics.total_retried, 1);

        // No attempts left: dead-lettered and the caller is told.
        let result = outcome(exhausted).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("interrupted"));
        assert_eq!(queue.dead_letters().len(), 1);
    }

    #[tokio::test]
    async fn test_rate_limited_tasks_stay_queued() {
        let queue = Arc::new(PriorityQueue::new("test"));
        let limiter = Arc::new(RateLimiter::new(
            "test",
            RateLimitConfig {
                per_minute: 1,
                per_hour: 0,
                min_delay: Duration::ZERO,
            },
        ));
        let handler = handler_fn(|_task| async { Ok(true) });

        let processor = QueueProcessor::new("test", queue.clone(), handler, fast_config(1))
            .with_rate_limiter(limiter.clone());
        let first = submit(&queue, "a", 0);
        let _second = submit(&queue, "b", 0);
        processor.start();

        assert!(outcome(first).await.success);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().metrics.total_processed, 1);
        assert_eq!(queue.stats().metrics.total_retried, 0);
        assert_eq!(limiter.usage().last_minute, 1);
        processor.stop().await;
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let queue = Arc::new(PriorityQueue::new("test"));
        let handler = handler_fn(|_task| async { Ok(true) });
        let processor = QueueProcessor::new("test", queue, handler, fast_config(2));

        processor.start();
        processor.start();
        assert!(processor.is_running());
        assert_eq!(processor.stats().workers, 2);

        processor.stop().await;
        processor.stop().await;
        assert!(!processor.is_running());
    }
}
