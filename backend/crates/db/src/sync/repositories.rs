use async_trait::async_trait;
use shopmirror_common::error::MirrorResult;
use shopmirror_common::types::ResourceType;
use uuid::Uuid;

use crate::sync::models::{ListRunsOptions, SubSyncProgress, SyncRun};

#[async_trait]
pub trait ProgressRepository: Send + Sync {
    /// Insert a new run together with its sub-progress records.
    async fn create_run(&self, run: &SyncRun) -> MirrorResult<SyncRun>;

    /// Persist run-level fields (requested, state, last_error). Sub-progress is
    /// owned by the workers and written through `save_progress`.
    async fn save_run(&self, run: &SyncRun) -> MirrorResult<()>;

    /// Insert or update one sub-progress record keyed by (run_id, resource_type).
    async fn save_progress(&self, progress: &SubSyncProgress) -> MirrorResult<()>;

    async fn find_run(&self, tenant: &str, run_id: Uuid) -> MirrorResult<Option<SyncRun>>;

    async fn find_latest_run(&self, tenant: &str) -> MirrorResult<Option<SyncRun>>;

    /// Runs for a tenant, newest first.
    async fn list_runs(&self, tenant: &str, options: ListRunsOptions)
        -> MirrorResult<Vec<SyncRun>>;

    /// Most recent seeded progress for (tenant, resource) across all runs,
    /// optionally skipping one run. Records still in `starting` are ignored.
    async fn find_latest_progress(
        &self,
        tenant: &str,
        resource_type: ResourceType,
        exclude_run: Option<Uuid>,
    ) -> MirrorResult<Option<SubSyncProgress>>;
}
