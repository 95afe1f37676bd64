//! Notification dispatch.
//!
//! Events are fanned out by the [`Dispatcher`] to every active channel in the
//! [`ServiceRegistry`]; each channel queues a [`NotificationTask`] on its own
//! lane and the [`DeliveryTracker`] records the per-channel outcomes.

pub mod channels;
pub mod dispatcher;
pub mod registry;
pub mod task;
pub mod tracker;

pub use dispatcher::{Dispatcher, DispatcherStats};
pub use registry::ServiceRegistry;
pub use task::{DeliveryStatus, NotificationTask, Payload, TaskPriority};
pub use tracker::{DeliveryStats, DeliveryTracker, DispatchRecord, DispatchStatus};
