//! Service layer.
//!
//! Wires the notification components together and manages their lifecycle.

pub mod container;

pub use container::{AppContext, ContextStats, MaintenanceReport};
