pub mod config;
pub mod error;
pub mod events;
pub mod options;
pub mod orchestrator;
pub mod remote;
pub mod retry;
pub mod shopify;
pub mod store;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::SyncSettings;
pub use error::SyncError;
pub use events::{RunEvent, RunHandle};
pub use options::{StartOutcome, StartSyncOptions, StartedSync};
pub use orchestrator::SyncOrchestrator;
pub use worker::{ResourceSyncWorker, SyncDeps};
