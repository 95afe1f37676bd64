//! In-memory priority queue with a time-scheduled retry lane.
//!
//! Tasks are served from the retry lane first (once their retry deadline has
//! passed) and then from the four priority tiers in `urgent → high → normal →
//! low` order, FIFO within a tier. Tasks that exhaust their retry budget move
//! to a bounded dead-letter store.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::notification::task::{DeliveryStatus, NotificationTask, TaskPriority};

/// Default base delay between retries (scaled by the retry number).
pub const DEFAULT_RETRY_DELAY_BASE: Duration = Duration::from_secs(60);

/// Default dead-letter capacity per queue.
pub const DEFAULT_DEAD_LETTER_CAPACITY: usize = 1000;

/// Terminal result of a queued task, reported to whoever submitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: Uuid,
    pub success: bool,
    pub retries: u32,
    pub error: Option<String>,
}

/// Queue-internal wrapper carrying scheduling state for a task.
#[derive(Debug)]
pub struct QueueTask {
    /// The wrapped notification task.
    pub task: NotificationTask,
    /// Base retry delay, multiplied by the retry number.
    pub retry_delay_base: Duration,
    /// Earliest time the task may be served from the retry lane.
    pub scheduled_at: DateTime<Utc>,
    /// Time of the most recent failed attempt.
    pub last_attempt_at: Option<DateTime<Utc>>,
    completion: Option<oneshot::Sender<TaskOutcome>>,
}

impl QueueTask {
    pub fn new(task: NotificationTask, retry_delay_base: Duration) -> Self {
        Self {
            task,
            retry_delay_base,
            scheduled_at: Utc::now(),
            last_attempt_at: None,
            completion: None,
        }
    }

    /// Attach a completion channel resolved when the task reaches a terminal state.
    pub fn with_completion(mut self) -> (Self, oneshot::Receiver<TaskOutcome>) {
        let (tx, rx) = oneshot::channel();
        self.completion = Some(tx);
        (self, rx)
    }

    pub fn id(&self) -> Uuid {
        self.task.id()
    }

    pub fn priority(&self) -> TaskPriority {
        self.task.priority
    }

    fn complete(&mut self) {
        if let Some(tx) = self.completion.take() {
            let outcome = TaskOutcome {
                task_id: self.task.id(),
                success: self.task.status() == DeliveryStatus::Delivered,
                retries: self.task.retry_count(),
                error: self.task.error_message().map(str::to_string),
            };
            // Receiver may have given up waiting.
            let _ = tx.send(outcome);
        }
    }
}

/// Cumulative queue counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub total_added: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_retried: u64,
}

/// Pending task count per priority tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCounts {
    pub urgent: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
}

impl TierCounts {
    pub fn total(&self) -> usize {
        self.urgent + self.high + self.normal + self.low
    }
}

/// Snapshot of a queue's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub name: String,
    pub pending: TierCounts,
    pub retry_count: usize,
    pub failed_count: usize,
    pub metrics: QueueMetrics,
}

#[derive(Debug, Default)]
struct QueueState {
    tiers: [VecDeque<QueueTask>; 4],
    retry_lane: VecDeque<QueueTask>,
    dead_letters: VecDeque<QueueTask>,
    metrics: QueueMetrics,
}

/// A named multi-tier queue.
#[derive(Debug)]
pub struct PriorityQueue {
    name: String,
    state: Mutex<QueueState>,
    notify: Arc<Notify>,
    dead_letter_capacity: usize,
}

impl PriorityQueue {
    /// Create a new queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_dead_letter_capacity(name, DEFAULT_DEAD_LETTER_CAPACITY)
    }

    /// Create a new queue with a custom dead-letter bound.
    pub fn with_dead_letter_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            notify: Arc::new(Notify::new()),
            dead_letter_capacity: capacity.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle woken whenever a task is added.
    pub fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Append a task to the tail of its priority tier.
    pub fn add(&self, task: QueueTask) {
        let task_id = task.id();
        let priority = task.priority();
        {
            let mut state = self.state.lock();
            state.tiers[priority.tier_index()].push_back(task);
            state.metrics.total_added += 1;
        }
        self.notify.notify_one();
        debug!(queue = %self.name, task_id = %task_id, priority = %priority, "Task added");
    }

    /// Take the next ready task, if any.
    pub fn get_next(&self) -> Option<QueueTask> {
        self.get_next_at(Utc::now())
    }

    /// Take the next task ready at `now`.
    ///
    /// A due retry is served ahead of every priority tier.
    pub fn get_next_at(&self, now: DateTime<Utc>) -> Option<QueueTask> {
        let mut state = self.state.lock();

        if let Some(idx) = state
            .retry_lane
            .iter()
            .position(|t| t.scheduled_at <= now)
        {
            return state.retry_lane.remove(idx);
        }

        state.tiers.iter_mut().find_map(VecDeque::pop_front)
    }

    /// Return an unattempted task to the head of the lane it came from.
    pub fn defer(&self, task: QueueTask) {
        let mut state = self.state.lock();
        if task.task.status() == DeliveryStatus::Retrying {
            state.retry_lane.push_front(task);
        } else {
            let idx = task.priority().tier_index();
            state.tiers[idx].push_front(task);
        }
    }

    /// Record a successful delivery; the task is dropped afterwards.
    pub fn mark_processed(&self, mut task: QueueTask) {
        if let Err(e) = ensure_processing(&mut task.task).and_then(|_| task.task.mark_delivered()) {
            warn!(queue = %self.name, task_id = %task.id(), "Unexpected state on success: {}", e);
        }

        self.state.lock().metrics.total_processed += 1;
        task.complete();
        debug!(queue = %self.name, task_id = %task.id(), "Task processed successfully");
    }

    /// Record a failed attempt, scheduling a retry or dead-lettering the task.
    ///
    /// Returns the task's resulting status.
    pub fn mark_failed(&self, task: QueueTask, error_message: &str) -> DeliveryStatus {
        self.mark_failed_at(task, error_message, Utc::now())
    }

    /// [`mark_failed`](Self::mark_failed) with an explicit clock.
    pub fn mark_failed_at(
        &self,
        mut task: QueueTask,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> DeliveryStatus {
        task.last_attempt_at = Some(now);

        let retry = match ensure_processing(&mut task.task)
            .and_then(|_| task.task.record_failure(error_message))
        {
            Ok(retry) => retry,
            Err(e) => {
                error!(queue = %self.name, task_id = %task.id(), "Cannot record failure: {}", e);
                return task.task.status();
            }
        };

        let mut state = self.state.lock();
        if retry {
            let retry_count = task.task.retry_count();
            let delay = task.retry_delay_base.saturating_mul(retry_count);
            let delay = TimeDelta::from_std(delay).unwrap_or(TimeDelta::MAX);
            task.scheduled_at = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
            state.metrics.total_retried += 1;

            info!(
                queue = %self.name,
                task_id = %task.id(),
                retry = retry_count,
                max_retries = task.task.max_retries,
                scheduled_at = %task.scheduled_at,
                "Task scheduled for retry"
            );
            state.retry_lane.push_back(task);
            DeliveryStatus::Retrying
        } else {
            error!(
                queue = %self.name,
                task_id = %task.id(),
                retries = task.task.retry_count(),
                "Task failed permanently: {}",
                error_message
            );
            state.metrics.total_failed += 1;
            task.complete();

            if state.dead_letters.len() >= self.dead_letter_capacity {
                if let Some(evicted) = state.dead_letters.pop_front() {
                    warn!(
                        queue = %self.name,
                        task_id = %evicted.id(),
                        "Dead-letter store full, evicting oldest entry"
                    );
                }
            }
            state.dead_letters.push_back(task);
            DeliveryStatus::Failed
        }
    }

    /// Snapshot of the tasks in the dead-letter store.
    pub fn dead_letters(&self) -> Vec<NotificationTask> {
        self.state
            .lock()
            .dead_letters
            .iter()
            .map(|t| t.task.clone())
            .collect()
    }

    /// Move every dead letter back into its priority tier with a fresh budget.
    ///
    /// Returns the number of tasks re-injected.
    pub fn requeue_dead_letters(&self) -> usize {
        let count = {
            let mut state = self.state.lock();
            let drained: Vec<QueueTask> = state.dead_letters.drain(..).collect();
            let count = drained.len();
            for mut task in drained {
                task.task.reset_for_requeue();
                task.scheduled_at = Utc::now();
                let idx = task.priority().tier_index();
                state.tiers[idx].push_back(task);
            }
            count
        };

        if count > 0 {
            info!(queue = %self.name, count, "Re-queued dead letters");
            self.notify.notify_waiters();
        }
        count
    }

    /// Number of tasks waiting in tiers and the retry lane.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state.tiers.iter().map(VecDeque::len).sum::<usize>() + state.retry_lane.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Earliest scheduled retry, if any.
    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .retry_lane
            .iter()
            .map(|t| t.scheduled_at)
            .min()
    }

    /// Counts per tier, retry lane and dead-letter sizes plus cumulative counters.
    pub fn stats(&self) -> QueueStats {
        let state = self.state.lock();
        QueueStats {
            name: self.name.clone(),
            pending: TierCounts {
                urgent: state.tiers[TaskPriority::Urgent.tier_index()].len(),
                high: state.tiers[TaskPriority::High.tier_index()].len(),
                normal: state.tiers[TaskPriority::Normal.tier_index()].len(),
                low: state.tiers[TaskPriority::Low.tier_index()].len(),
            },
            retry_count: state.retry_lane.len(),
            failed_count: state.dead_letters.len(),
            metrics: state.metrics,
        }
    }
}

/// Bring a freshly popped task into `processing` if its owner has not.
fn ensure_processing(task: &mut NotificationTask) -> crate::Result<()> {
    match task.status() {
        DeliveryStatus::Pending | DeliveryStatus::Retrying => task.begin_attempt(),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::task::Payload;

    fn make_task(priority: TaskPriority) -> QueueTask {
        let task = NotificationTask::new("test", "user-1", Payload::new()).with_priority(priority);
        QueueTask::new(task, Duration::from_secs(10))
    }

    #[test]
    fn test_urgent_served_before_high() {
        let queue = PriorityQueue::new("test");
        let a = make_task(TaskPriority::High);
        let b = make_task(TaskPriority::Urgent);
        let (a_id, b_id) = (a.id(), b.id());

        queue.add(a);
        queue.add(b);

        assert_eq!(queue.get_next().unwrap().id(), b_id);
        assert_eq!(queue.get_next().unwrap().id(), a_id);
        assert!(queue.get_next().is_none());
    }

    #[test]
    fn test_mixed_priorities_drain_in_tier_order() {
        let queue = PriorityQueue::new("test");
        let order = [
            TaskPriority::Low,
            TaskPriority::Normal,
            TaskPriority::Urgent,
            TaskPriority::Low,
            TaskPriority::High,
            TaskPriority::Normal,
            TaskPriority::Urgent,
        ];
        for p in order {
            queue.add(make_task(p));
        }

        let mut served = Vec::new();
        while let Some(task) = queue.get_next() {
            served.push(task.priority());
        }

        assert_eq!(served.len(), order.len());
        assert!(served.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_fifo_within_tier() {
        let queue = PriorityQueue::new("test");
        let ids: Vec<Uuid> = (0..5)
            .map(|_| {
                let t = make_task(TaskPriority::Normal);
                let id = t.id();
                queue.add(t);
                id
            })
            .collect();

        let served: Vec<Uuid> = std::iter::from_fn(|| queue.get_next().map(|t| t.id())).collect();
        assert_eq!(served, ids);
    }

    #[test]
    fn test_due_retry_preempts_urgent() {
        let queue = PriorityQueue::new("test");
        let now = Utc::now();

        queue.add(make_task(TaskPriority::Low));
        let low = queue.get_next_at(now).unwrap();
        let low_id = low.id();
        assert_eq!(queue.mark_failed_at(low, "boom", now), DeliveryStatus::Retrying);

        queue.add(make_task(TaskPriority::Urgent));

        // Not yet due: urgent wins.
        let first = queue.get_next_at(now).unwrap();
        assert_eq!(first.priority(), TaskPriority::Urgent);
        queue.defer(first);

        // Due: retry wins over urgent.
        let later = now + TimeDelta::seconds(11);
        assert_eq!(queue.get_next_at(later).unwrap().id(), low_id);
        assert_eq!(queue.get_next_at(later).unwrap().priority(), TaskPriority::Urgent);
    }

    #[test]
    fn test_retry_exhaustion_dead_letters_task() {
        let queue = PriorityQueue::new("test");
        let task = NotificationTask::new("test", "user-1", Payload::new()).with_max_retries(2);
        let task_id = task.id();
        queue.add(QueueTask::new(task, Duration::from_secs(1)));

        let mut now = Utc::now();
        let mut statuses = Vec::new();
        for _ in 0..3 {
            let task = queue.get_next_at(now).expect("task should be ready");
            assert_eq!(task.id(), task_id);
            statuses.push(queue.mark_failed_at(task, "boom", now));
            now += TimeDelta::seconds(60);
        }

        assert_eq!(
            statuses,
            vec![
                DeliveryStatus::Retrying,
                DeliveryStatus::Retrying,
                DeliveryStatus::Failed
            ]
        );
        assert!(queue.get_next_at(now).is_none());

        let dead = queue.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].status(), DeliveryStatus::Failed);
        assert_eq!(dead[0].retry_count(), 2);

        let stats = queue.stats();
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.metrics.total_retried, 2);
        assert_eq!(stats.metrics.total_failed, 1);
        assert_eq!(stats.pending.total(), 0);
    }

    #[test]
    fn test_backoff_is_linear_in_retry_count() {
        let queue = PriorityQueue::new("test");
        let task = NotificationTask::new("test", "user-1", Payload::new()).with_max_retries(4);
        queue.add(QueueTask::new(task, Duration::from_secs(30)));

        let mut now = Utc::now();
        let mut deltas = Vec::new();
        for _ in 0..4 {
            let task = queue.get_next_at(now).unwrap();
            queue.mark_failed_at(task, "boom", now);
            let scheduled = queue.next_retry_at().unwrap();
            deltas.push((scheduled - now).num_seconds());
            now = scheduled;
        }

        assert_eq!(deltas, vec![30, 60, 90, 120]);
        assert!(deltas.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_dead_letter_store_is_bounded() {
        let queue = PriorityQueue::with_dead_letter_capacity("test", 2);
        for _ in 0..3 {
            let task = NotificationTask::new("test", "user-1", Payload::new()).with_max_retries(0);
            queue.add(QueueTask::new(task, Duration::from_secs(1)));
            let task = queue.get_next().unwrap();
            queue.mark_failed(task, "boom");
        }

        assert_eq!(queue.dead_letters().len(), 2);
        assert_eq!(queue.stats().metrics.total_failed, 3);
    }

    #[test]
    fn test_requeue_dead_letters_resets_budget() {
        let queue = PriorityQueue::new("test");
        let task = NotificationTask::new("test", "user-1", Payload::new())
            .with_max_retries(0)
            .with_priority(TaskPriority::High);
        queue.add(QueueTask::new(task, Duration::from_secs(1)));
        let task = queue.get_next().unwrap();
        queue.mark_failed(task, "boom");

        assert_eq!(queue.requeue_dead_letters(), 1);
        assert!(queue.dead_letters().is_empty());

        let stats = queue.stats();
        assert_eq!(stats.pending.high, 1);

        let task = queue.get_next().unwrap();
        assert_eq!(task.task.status(), DeliveryStatus::Pending);
        assert_eq!(task.task.retry_count(), 0);
    }

    #[test]
    fn test_mark_processed_counts_and_completes() {
        let queue = PriorityQueue::new("test");
        let (task, mut rx) = make_task(TaskPriority::Normal).with_completion();
        queue.add(task);

        let task = queue.get_next().unwrap();
        queue.mark_processed(task);

        let outcome = rx.try_recv().unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.retries, 0);
        assert_eq!(queue.stats().metrics.total_processed, 1);
    }

    #[test]
    fn test_completion_survives_retries() {
        let queue = PriorityQueue::new("test");
        let task = NotificationTask::new("test", "user-1", Payload::new()).with_max_retries(1);
        let (task, mut rx) = QueueTask::new(task, Duration::ZERO).with_completion();
        queue.add(task);

        let now = Utc::now();
        let task = queue.get_next_at(now).unwrap();
        queue.mark_failed_at(task, "first", now);
        assert!(rx.try_recv().is_err());

        let task = queue.get_next_at(now).unwrap();
        queue.mark_failed_at(task, "second", now);

        let outcome = rx.try_recv().unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.retries, 1);
        assert_eq!(outcome.error.as_deref(), Some("second"));
    }

    #[test]
    fn test_defer_returns_task_to_head() {
        let queue = PriorityQueue::new("test");
        let first = make_task(TaskPriority::Normal);
        let first_id = first.id();
        queue.add(first);
        queue.add(make_task(TaskPriority::Normal));

        let task = queue.get_next().unwrap();
        queue.defer(task);

        assert_eq!(queue.get_next().unwrap().id(), first_id);
        assert_eq!(queue.stats().metrics.total_added, 2);
    }
}
