//! Priority queues and the worker pools that drain them.

pub mod manager;
pub mod priority_queue;
pub mod processor;

pub use manager::{ManagerStats, QueueManager};
pub use priority_queue::{
    PriorityQueue, QueueMetrics, QueueStats, QueueTask, TaskOutcome, TierCounts,
};
pub use processor::{ProcessorConfig, ProcessorStats, QueueProcessor, TaskHandler, handler_fn};
