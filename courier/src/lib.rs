//! Notification dispatch core: prioritized retrying queues, rate-limited
//! worker pools and multi-channel fan-out with delivery tracking.

pub mod config;
pub mod error;
pub mod logging;
pub mod notification;
pub mod queue;
pub mod rate_limit;
pub mod services;

pub use error::{Error, Result};
