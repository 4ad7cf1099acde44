//! Application layer: the Coordinator and the alert watcher.

pub mod coordinator;
pub mod watcher;

pub use coordinator::{Coordinator, CoordinatorResponse};
pub use watcher::{AlertProcessor, AlertWatcher, PollStats};
