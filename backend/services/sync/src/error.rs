use shopmirror_common::error::MirrorError;
use thiserror::Error;
use uuid::Uuid;

/// Recorded on a run whose owner stopped answering liveness pings.
pub const SYNC_TIMED_OUT: &str = "sync timed out";

/// Recorded on a run that did not end within the cancel acknowledgement window.
pub const SYNC_NOT_RESPONDING: &str = "sync progress not responding";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("sync in progress for {tenant} (run {run_id})")]
    SyncInProgress { tenant: String, run_id: Uuid },

    #[error("sync progress not responding (run {run_id})")]
    NotResponding { run_id: Uuid },

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] MirrorError),
}
