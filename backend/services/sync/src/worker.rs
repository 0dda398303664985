use std::sync::Arc;

use chrono::Utc;
use shopmirror_common::error::MirrorError;
use shopmirror_common::types::ResourceType;
use shopmirror_db::sync::models::{ProgressState, SubSyncProgress};
use shopmirror_db::sync::repositories::ProgressRepository;

use crate::config::SyncSettings;
use crate::events::WorkerSignals;
use crate::remote::{Counter, PageRequest, Pager, RemoteError, RemoteItem};
use crate::retry::with_retry;
use crate::store::Upserter;

/// Collaborators shared by every worker of an orchestrator.
#[derive(Clone)]
pub struct SyncDeps {
    pub counter: Arc<dyn Counter>,
    pub pager: Arc<dyn Pager>,
    pub upserter: Arc<dyn Upserter>,
    pub progress: Arc<dyn ProgressRepository>,
}

/// One resource of one run.
#[derive(Debug, Clone)]
pub struct WorkerAssignment {
    /// The `starting` record created with the run.
    pub progress: SubSyncProgress,
    pub resync: bool,
    pub include_transactions: bool,
}

#[derive(Debug, thiserror::Error)]
enum StepError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Store(#[from] MirrorError),
}

enum Finish {
    Completed,
    Cancelled,
}

/// Pulls one resource type page by page, checkpointing after every page so
/// the next run can resume from `since_id`.
pub struct ResourceSyncWorker {
    deps: SyncDeps,
    settings: SyncSettings,
}

impl ResourceSyncWorker {
    pub fn new(deps: SyncDeps, settings: SyncSettings) -> Self {
        Self { deps, settings }
    }

    /// Sync the assigned resource to a terminal state. Errors end up in the
    /// returned record rather than being propagated.
    pub async fn run(&self, assignment: WorkerAssignment, signals: &WorkerSignals) -> SubSyncProgress {
        let mut progress = assignment.progress.clone();
        let resource = progress.resource_type;

        let result = self.sync(&mut progress, &assignment, signals).await;
        match result {
            Ok(Finish::Completed) => {
                progress.state = ProgressState::Success;
                tracing::info!(
                    tenant = %progress.tenant,
                    resource = %resource,
                    synced = progress.synced_count,
                    "resource sync complete"
                );
            }
            Ok(Finish::Cancelled) => {
                progress.state = ProgressState::Cancelled;
                tracing::info!(
                    tenant = %progress.tenant,
                    resource = %resource,
                    synced = progress.synced_count,
                    "resource sync cancelled"
                );
            }
            Err(err) => {
                progress.state = ProgressState::Failed;
                progress.error = Some(err.to_string());
                tracing::error!(
                    tenant = %progress.tenant,
                    resource = %resource,
                    since_id = progress.since_id,
                    error = %err,
                    "resource sync failed"
                );
            }
        }

        progress.updated_at = Utc::now();
        self.checkpoint(&progress, signals).await;
        signals.report(&progress);
        progress
    }

    async fn sync(
        &self,
        progress: &mut SubSyncProgress,
        assignment: &WorkerAssignment,
        signals: &WorkerSignals,
    ) -> Result<Finish, StepError> {
        let tenant = progress.tenant.clone();
        let resource = progress.resource_type;
        let run_id = progress.run_id;
        let policy = &self.settings.retry;

        if !assignment.resync {
            let previous = with_retry(policy, "find_latest_progress", || {
                self.deps
                    .progress
                    .find_latest_progress(&tenant, resource, Some(run_id))
            })
            .await?;
            if let Some(previous) = previous {
                seed_from(progress, &previous);
                tracing::info!(
                    tenant = %tenant,
                    resource = %resource,
                    continued_from = %previous.id,
                    since_id = progress.since_id,
                    synced = progress.synced_count,
                    "resuming from earlier progress"
                );
            }
        }

        progress.state = ProgressState::Running;
        progress.updated_at = Utc::now();
        self.checkpoint(progress, signals).await;
        signals.report(progress);

        let total = with_retry(policy, "count", || self.deps.counter.count(&tenant, resource)).await?;
        progress.shopify_count = i64::try_from(total).unwrap_or(i64::MAX);

        let page_size = self.settings.page_size.max(1);
        let remaining = (progress.shopify_count - progress.synced_count).max(0) as u64;
        let pages = remaining.div_ceil(u64::from(page_size));

        tracing::info!(
            tenant = %tenant,
            resource = %resource,
            total,
            synced = progress.synced_count,
            since_id = progress.since_id,
            pages,
            "resource sync started"
        );

        for page in 1..=pages {
            if signals.is_cancelled() {
                progress.state = ProgressState::Cancelling;
                progress.updated_at = Utc::now();
                self.checkpoint(progress, signals).await;
                signals.report(progress);
                return Ok(Finish::Cancelled);
            }

            let request = PageRequest {
                page,
                page_size,
                since_id: progress.since_id,
            };
            let items = with_retry(policy, "list_page", || {
                self.deps.pager.list_page(&tenant, resource, &request)
            })
            .await?;

            if signals.is_orphaned() {
                tracing::warn!(
                    tenant = %tenant,
                    resource = %resource,
                    page,
                    "run orphaned while fetching, dropping page"
                );
                return Ok(Finish::Cancelled);
            }

            let Some(max_id) = items.iter().map(|item| item.id).max() else {
                tracing::debug!(
                    tenant = %tenant,
                    resource = %resource,
                    page,
                    "empty page, collection exhausted early"
                );
                break;
            };
            if max_id <= progress.since_id {
                return Err(RemoteError::Decode(format!(
                    "page {page} did not advance past since_id {}",
                    progress.since_id
                ))
                .into());
            }

            with_retry(policy, "upsert", || {
                self.deps.upserter.upsert_many(&tenant, resource, None, &items)
            })
            .await?;

            if resource == ResourceType::Orders && assignment.include_transactions {
                self.sync_children(&tenant, ResourceType::Transactions, &items)
                    .await?;
            }

            progress.synced_count += items.len() as i64;
            progress.since_id = max_id;
            progress.last_id = Some(max_id);
            if let Some(label) = items.last().and_then(|item| item.label.clone()) {
                progress.info = Some(label);
            }
            progress.updated_at = Utc::now();
            self.checkpoint(progress, signals).await;
            signals.report(progress);

            tracing::debug!(
                tenant = %tenant,
                resource = %resource,
                page,
                pages,
                synced = progress.synced_count,
                last_id = max_id,
                "page synced"
            );

            if page < pages {
                signals.pause(self.settings.page_delay).await;
            }
        }

        Ok(Finish::Completed)
    }

    async fn sync_children(
        &self,
        tenant: &str,
        child: ResourceType,
        parents: &[RemoteItem],
    ) -> Result<(), StepError> {
        let policy = &self.settings.retry;
        for parent in parents {
            let children = with_retry(policy, "list_children", || {
                self.deps.pager.list_children(tenant, child, parent.id)
            })
            .await?;
            if children.is_empty() {
                continue;
            }
            with_retry(policy, "upsert", || {
                self.deps
                    .upserter
                    .upsert_many(tenant, child, Some(parent.id), &children)
            })
            .await?;
        }
        Ok(())
    }

    /// Persist `progress`. A write that still fails after retries is logged and
    /// the sync carries on; the next checkpoint supersedes it. Nothing is
    /// written once the run has been orphaned.
    async fn checkpoint(&self, progress: &SubSyncProgress, signals: &WorkerSignals) {
        if signals.is_orphaned() {
            tracing::debug!(
                tenant = %progress.tenant,
                resource = %progress.resource_type,
                state = progress.state.as_str(),
                "run orphaned, progress not persisted"
            );
            return;
        }
        let result = with_retry(&self.settings.retry, "save_progress", || {
            self.deps.progress.save_progress(progress)
        })
        .await;
        if let Err(err) = result {
            tracing::warn!(
                tenant = %progress.tenant,
                resource = %progress.resource_type,
                state = progress.state.as_str(),
                error = %err,
                "failed to persist progress"
            );
        }
    }
}

/// Continue where `previous` stopped.
fn seed_from(progress: &mut SubSyncProgress, previous: &SubSyncProgress) {
    progress.since_id = previous.last_id.unwrap_or(previous.since_id);
    progress.last_id = previous.last_id;
    progress.synced_count = previous.synced_count;
    progress.info = previous.info.clone();
    progress.continued_from = Some(previous.id);
}
