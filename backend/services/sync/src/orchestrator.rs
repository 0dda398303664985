use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use shopmirror_common::error::{MirrorError, MirrorResult};
use shopmirror_common::types::ResourceType;
use shopmirror_db::sync::models::{
    ListRunsOptions, ProgressState, RequestedResources, RunState, SubSyncProgress, SyncRun,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::SyncSettings;
use crate::error::{SyncError, SYNC_NOT_RESPONDING, SYNC_TIMED_OUT};
use crate::events::{RunCommand, RunEvent, RunHandle, RunListeners, RunRegistry, WorkerSignals};
use crate::options::{StartOutcome, StartSyncOptions, StartedSync};
use crate::retry::with_retry;
use crate::worker::{ResourceSyncWorker, SyncDeps, WorkerAssignment};

/// Entry point for starting, joining and cancelling sync runs.
///
/// At most one live run exists per tenant. Decisions for a tenant are
/// serialised, so concurrent callers see each other's runs.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    deps: SyncDeps,
    settings: SyncSettings,
    registry: RunRegistry,
    tenant_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Decision {
    Coalesce,
    Attach(Vec<ResourceType>),
    Conflict,
}

/// How a new request relates to the run already in flight.
fn decide(existing: &RequestedResources, options: &StartSyncOptions) -> Decision {
    if options.resync && !existing.resync {
        return Decision::Conflict;
    }
    if options.include_transactions
        && !existing.include_transactions
        && options.resources.contains(&ResourceType::Orders)
    {
        return Decision::Conflict;
    }

    let missing: Vec<ResourceType> = options
        .resources
        .difference(&existing.resources)
        .copied()
        .collect();
    if missing.is_empty() {
        Decision::Coalesce
    } else {
        Decision::Attach(missing)
    }
}

/// Final run state from terminal sub-progress records in completion order.
fn aggregate(completed: &[SubSyncProgress]) -> (RunState, Option<String>) {
    if let Some(failed) = completed.iter().find(|p| p.state == ProgressState::Failed) {
        let message = failed.error.as_deref().unwrap_or("unknown error");
        return (
            RunState::Failed,
            Some(format!("{}:{}", failed.resource_type, message)),
        );
    }
    if completed.iter().any(|p| p.state == ProgressState::Cancelled) {
        return (RunState::Cancelled, None);
    }
    (RunState::Success, None)
}

impl SyncOrchestrator {
    pub fn new(deps: SyncDeps, settings: SyncSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                deps,
                settings,
                registry: RunRegistry::default(),
                tenant_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn start_sync(
        &self,
        tenant: &str,
        options: StartSyncOptions,
    ) -> Result<StartedSync, SyncError> {
        options.validate()?;

        let lock = self.inner.tenant_lock(tenant);
        let result = {
            let _guard = lock.lock().await;
            self.start_locked(tenant, options).await
        };
        self.inner.release_tenant_lock(tenant, lock);
        result
    }

    async fn start_locked(
        &self,
        tenant: &str,
        options: StartSyncOptions,
    ) -> Result<StartedSync, SyncError> {
        let mut superseded = None;
        if let Some(existing) = self.inner.deps.progress.find_latest_run(tenant).await? {
            if !existing.state.is_terminal() {
                match self.inner.live_handle(&existing).await {
                    None => {
                        self.inner
                            .mark_orphaned(tenant, existing.id, SYNC_TIMED_OUT)
                            .await?;
                    }
                    Some(handle) => match decide(&existing.requested, &options) {
                        Decision::Coalesce => {
                            tracing::info!(tenant, run_id = %existing.id, "joining running sync");
                            return Ok(StartedSync {
                                outcome: StartOutcome::Coalesced,
                                run: existing,
                            });
                        }
                        Decision::Attach(missing) if options.attach_to_existing => {
                            match handle.attach(missing.clone()).await {
                                Some(Ok(run)) => {
                                    return Ok(StartedSync {
                                        outcome: StartOutcome::Attached(missing),
                                        run,
                                    });
                                }
                                Some(Err(err)) => return Err(err.into()),
                                None => {
                                    tracing::info!(
                                        tenant,
                                        run_id = %existing.id,
                                        "running sync is finishing, starting a new one"
                                    );
                                }
                            }
                        }
                        _ if options.cancel_existing => {
                            self.inner.supersede(&handle).await?;
                            superseded = Some(existing.id);
                        }
                        _ => {
                            return Err(SyncError::SyncInProgress {
                                tenant: tenant.to_string(),
                                run_id: existing.id,
                            });
                        }
                    },
                }
            }
        }

        let run = Inner::launch(&self.inner, tenant, options.requested()).await?;
        let outcome = match superseded {
            Some(previous) => StartOutcome::Superseded { previous },
            None => StartOutcome::Created,
        };
        Ok(StartedSync { outcome, run })
    }

    /// Cancel `run_id`, or the tenant's latest run, and wait for it to end.
    pub async fn cancel_sync(&self, tenant: &str, run_id: Option<Uuid>) -> Result<SyncRun, SyncError> {
        let repo = &self.inner.deps.progress;
        let run = match run_id {
            Some(id) => repo.find_run(tenant, id).await?,
            None => repo.find_latest_run(tenant).await?,
        }
        .ok_or_else(|| MirrorError::NotFound(format!("no sync run for {tenant}")))?;

        if run.state.is_terminal() {
            return Ok(run);
        }

        let Some(handle) = self.inner.registry.get(run.id) else {
            self.inner
                .mark_orphaned(tenant, run.id, SYNC_NOT_RESPONDING)
                .await?;
            return Err(SyncError::NotResponding { run_id: run.id });
        };

        tracing::info!(tenant, run_id = %run.id, "cancelling sync");
        handle.cancel();
        match handle
            .wait_finished(Some(self.inner.settings.cancel_timeout))
            .await
        {
            Some(finished) => Ok(finished),
            None => {
                self.inner
                    .mark_orphaned(tenant, run.id, SYNC_NOT_RESPONDING)
                    .await?;
                Err(SyncError::NotResponding { run_id: run.id })
            }
        }
    }

    pub async fn get_latest_run(&self, tenant: &str) -> Result<Option<SyncRun>, SyncError> {
        Ok(self.inner.deps.progress.find_latest_run(tenant).await?)
    }

    pub async fn list_runs(
        &self,
        tenant: &str,
        options: ListRunsOptions,
    ) -> Result<Vec<SyncRun>, SyncError> {
        Ok(self.inner.deps.progress.list_runs(tenant, options).await?)
    }

    /// Events of a run owned by this process, if it is still live.
    pub fn subscribe(&self, run_id: Uuid) -> Option<broadcast::Receiver<RunEvent>> {
        self.inner.registry.get(run_id).map(|h| h.subscribe())
    }

    /// Wait for a live run to finish, or read a finished one.
    pub async fn wait_for_run(&self, tenant: &str, run_id: Uuid) -> Result<SyncRun, SyncError> {
        if let Some(handle) = self.inner.registry.get(run_id) {
            if let Some(run) = handle.wait_finished(None).await {
                return Ok(run);
            }
        }
        self.inner
            .deps
            .progress
            .find_run(tenant, run_id)
            .await?
            .ok_or_else(|| MirrorError::NotFound(format!("sync run {run_id}")).into())
    }

    /// Signal every live run to stop. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let handles = self.inner.registry.handles();
        for handle in &handles {
            handle.cancel();
        }
        handles.len()
    }
}

impl Inner {
    fn tenant_lock(&self, tenant: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .tenant_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(tenant.to_string()).or_default())
    }

    /// Drop the tenant's lock entry when no other caller holds or waits on it.
    fn release_tenant_lock(&self, tenant: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self
            .tenant_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(tenant);
        }
        drop(lock);
    }

    /// The run's handle if its supervisor answers a ping in time.
    async fn live_handle(&self, run: &SyncRun) -> Option<RunHandle> {
        let Some(handle) = self.registry.get(run.id) else {
            tracing::warn!(
                tenant = %run.tenant,
                run_id = %run.id,
                "unfinished run has no owner in this process"
            );
            return None;
        };
        if handle.ping(self.settings.liveness_timeout).await {
            Some(handle)
        } else {
            tracing::warn!(
                tenant = %run.tenant,
                run_id = %run.id,
                timeout_ms = self.settings.liveness_timeout.as_millis() as u64,
                "run did not answer liveness ping"
            );
            None
        }
    }

    async fn supersede(&self, handle: &RunHandle) -> MirrorResult<()> {
        tracing::info!(
            tenant = %handle.tenant,
            run_id = %handle.run_id,
            "cancelling running sync to start a new one"
        );
        handle.cancel();
        if handle
            .wait_finished(Some(self.settings.cancel_timeout))
            .await
            .is_none()
        {
            self.mark_orphaned(&handle.tenant, handle.run_id, SYNC_NOT_RESPONDING)
                .await?;
        }
        Ok(())
    }

    /// Fail a run whose supervisor is gone or stuck. Seeded sub-progress that
    /// was still moving is failed with it; finished runs are left alone.
    async fn mark_orphaned(&self, tenant: &str, run_id: Uuid, reason: &str) -> MirrorResult<()> {
        if let Some(handle) = self.registry.remove(run_id) {
            handle.orphan();
        }

        let Some(mut run) = self.deps.progress.find_run(tenant, run_id).await? else {
            return Ok(());
        };
        if run.state.is_terminal() {
            return Ok(());
        }

        let now = Utc::now();
        for progress in run.sub_progress.values_mut() {
            if matches!(
                progress.state,
                ProgressState::Running | ProgressState::Cancelling
            ) {
                progress.state = ProgressState::Failed;
                progress.error = Some(reason.to_string());
                progress.updated_at = now;
                self.deps.progress.save_progress(progress).await?;
            }
        }

        run.state = RunState::Failed;
        run.last_error = Some(reason.to_string());
        run.updated_at = now;
        self.deps.progress.save_run(&run).await?;

        tracing::warn!(tenant, run_id = %run_id, reason, "marked run failed");
        Ok(())
    }

    async fn launch(
        inner: &Arc<Inner>,
        tenant: &str,
        requested: RequestedResources,
    ) -> MirrorResult<SyncRun> {
        let run = inner
            .deps
            .progress
            .create_run(&SyncRun::new(tenant, requested))
            .await?;

        let (handle, listeners) = RunHandle::channel(run.id, tenant);
        inner.registry.register(handle);

        tracing::info!(
            tenant,
            run_id = %run.id,
            resources = ?run.requested.resources,
            resync = run.requested.resync,
            "sync run created"
        );

        let (progress_tx, progress_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            inner: Arc::clone(inner),
            run: run.clone(),
            listeners,
            progress_tx,
            progress_rx,
            workers: JoinSet::new(),
            completed: Vec::new(),
        };
        tokio::spawn(supervisor.run());

        Ok(run)
    }
}

/// Owns one run from `running` to a terminal state.
struct Supervisor {
    inner: Arc<Inner>,
    run: SyncRun,
    listeners: RunListeners,
    progress_tx: mpsc::UnboundedSender<SubSyncProgress>,
    progress_rx: mpsc::UnboundedReceiver<SubSyncProgress>,
    workers: JoinSet<SubSyncProgress>,
    /// Terminal sub-progress in the order workers finished.
    completed: Vec<SubSyncProgress>,
}

impl Supervisor {
    async fn run(mut self) {
        self.run.state = RunState::Running;
        self.run.updated_at = Utc::now();
        self.persist_run().await;
        self.listeners.emit(RunEvent::Running(self.run.clone()));

        let assigned: Vec<SubSyncProgress> = self.run.sub_progress.values().cloned().collect();
        for progress in assigned {
            self.spawn_worker(progress);
        }

        loop {
            tokio::select! {
                Some(command) = self.listeners.commands.recv() => {
                    self.handle_command(command).await;
                }
                Some(update) = self.progress_rx.recv() => {
                    self.apply_update(update);
                }
                Some(joined) = self.workers.join_next(), if !self.workers.is_empty() => {
                    match joined {
                        Ok(progress) => self.finish_worker(progress),
                        Err(err) => tracing::error!(run_id = %self.run.id, error = %err, "worker task lost"),
                    }
                    if self.workers.is_empty() {
                        break;
                    }
                }
            }
        }

        self.finish().await;
    }

    fn spawn_worker(&mut self, progress: SubSyncProgress) {
        let worker = ResourceSyncWorker::new(self.inner.deps.clone(), self.inner.settings.clone());
        let assignment = WorkerAssignment {
            progress: progress.clone(),
            resync: self.run.requested.resync,
            include_transactions: self.run.requested.include_transactions,
        };
        let signals = WorkerSignals {
            cancel: self.listeners.cancel.child_token(),
            orphaned: self.listeners.orphaned.clone(),
            progress: self.progress_tx.clone(),
        };
        let orphaned = signals.orphaned.clone();
        let deps = self.inner.deps.clone();
        let retry = self.inner.settings.retry.clone();

        self.workers.spawn(async move {
            let task = tokio::spawn(async move { worker.run(assignment, &signals).await });
            match task.await {
                Ok(done) => done,
                Err(err) => {
                    let mut failed = progress;
                    failed.state = ProgressState::Failed;
                    failed.error = Some(format!("worker panicked: {err}"));
                    failed.updated_at = Utc::now();
                    if orphaned.is_cancelled() {
                        return failed;
                    }
                    let saved = with_retry(&retry, "save_progress", || {
                        deps.progress.save_progress(&failed)
                    })
                    .await;
                    if let Err(save_err) = saved {
                        tracing::warn!(error = %save_err, "failed to persist worker failure");
                    }
                    failed
                }
            }
        });
    }

    async fn handle_command(&mut self, command: RunCommand) {
        match command {
            RunCommand::Ping(reply) => {
                let _ = reply.send(());
            }
            RunCommand::Attach { resources, reply } => {
                let result = self.attach(resources).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn attach(&mut self, resources: Vec<ResourceType>) -> MirrorResult<SyncRun> {
        if self.listeners.cancel.is_cancelled() {
            return Err(MirrorError::Validation(format!(
                "run {} is being cancelled",
                self.run.id
            )));
        }

        let added: Vec<ResourceType> = resources
            .into_iter()
            .filter(|r| !self.run.requested.includes(*r))
            .collect();
        for resource in &added {
            let progress = SubSyncProgress::starting(self.run.id, &self.run.tenant, *resource);
            self.inner.deps.progress.save_progress(&progress).await?;
            self.run.requested.resources.insert(*resource);
            self.run.sub_progress.insert(*resource, progress.clone());
            self.spawn_worker(progress);
        }
        self.run.updated_at = Utc::now();
        self.inner.deps.progress.save_run(&self.run).await?;

        tracing::info!(
            tenant = %self.run.tenant,
            run_id = %self.run.id,
            resources = ?added,
            "resources attached to running sync"
        );
        self.listeners.emit(RunEvent::Attached {
            resources: added,
            run: self.run.clone(),
        });
        Ok(self.run.clone())
    }

    fn apply_update(&mut self, update: SubSyncProgress) {
        let resource = update.resource_type;
        // The joined result is authoritative once a worker has finished.
        if self
            .run
            .sub_progress
            .get(&resource)
            .is_some_and(|p| p.state.is_terminal())
        {
            return;
        }
        self.run.sub_progress.insert(resource, update);
        self.listeners.emit(RunEvent::Sync(self.run.clone()));
    }

    fn finish_worker(&mut self, progress: SubSyncProgress) {
        self.run
            .sub_progress
            .insert(progress.resource_type, progress.clone());
        self.completed.push(progress);
        self.listeners.emit(RunEvent::Sync(self.run.clone()));
    }

    async fn finish(mut self) {
        if self.listeners.orphaned.is_cancelled() {
            self.finish_orphaned().await;
            return;
        }

        let (state, last_error) = aggregate(&self.completed);
        self.run.state = state;
        self.run.last_error = last_error;
        self.run.updated_at = Utc::now();
        self.persist_run().await;
        self.inner.registry.remove(self.run.id);

        match state {
            RunState::Failed => tracing::error!(
                tenant = %self.run.tenant,
                run_id = %self.run.id,
                error = self.run.last_error.as_deref().unwrap_or_default(),
                "sync run failed"
            ),
            _ => tracing::info!(
                tenant = %self.run.tenant,
                run_id = %self.run.id,
                state = state.as_str(),
                "sync run finished"
            ),
        }

        let event = match state {
            RunState::Failed => RunEvent::Failed(self.run.clone()),
            RunState::Cancelled => RunEvent::Cancelled(self.run.clone()),
            _ => RunEvent::Success(self.run.clone()),
        };
        self.listeners.emit(event);
        self.listeners.finished.send_replace(Some(self.run));
    }

    /// The run was already failed and unregistered by the orchestrator.
    /// Publish what was stored instead of overwriting it.
    async fn finish_orphaned(mut self) {
        match self
            .inner
            .deps
            .progress
            .find_run(&self.run.tenant, self.run.id)
            .await
        {
            Ok(Some(stored)) => self.run = stored,
            Ok(None) => {}
            Err(err) => tracing::warn!(
                run_id = %self.run.id,
                error = %err,
                "failed to reload orphaned run"
            ),
        }
        if !self.run.state.is_terminal() {
            self.run.state = RunState::Failed;
            self.run.last_error = Some(SYNC_NOT_RESPONDING.to_string());
        }

        tracing::warn!(
            tenant = %self.run.tenant,
            run_id = %self.run.id,
            error = self.run.last_error.as_deref().unwrap_or_default(),
            "orphaned sync run wound down"
        );
        let event = match self.run.state {
            RunState::Success => RunEvent::Success(self.run.clone()),
            RunState::Cancelled => RunEvent::Cancelled(self.run.clone()),
            _ => RunEvent::Failed(self.run.clone()),
        };
        self.listeners.emit(event);
        self.listeners.finished.send_replace(Some(self.run));
    }

    async fn persist_run(&self) {
        let result = with_retry(&self.inner.settings.retry, "save_run", || {
            self.inner.deps.progress.save_run(&self.run)
        })
        .await;
        if let Err(err) = result {
            tracing::warn!(
                run_id = %self.run.id,
                state = self.run.state.as_str(),
                error = %err,
                "failed to persist run"
            );
        }
    }
}
