pub mod backoff;
pub mod branch_filter;
pub mod classifier;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod reconcile;
pub mod scheduler;
pub mod store;
pub mod timestamp;
pub mod tracker;
pub mod writer;

#[cfg(test)]
mod test_support;

pub use error::{ItemError, ItemErrorKind, SyncError};
pub use orchestrator::{RunStatus, SyncOptions, SyncOrchestrator, SyncResult};
