//! In-process coordination between callers, a run's supervisor and its workers.
//!
//! Every live run owns a [`RunHandle`]. Callers use it to check liveness,
//! attach resources, cancel, and observe events; the supervisor owns the
//! receiving ends. Delivery is best-effort: a lagging or absent subscriber
//! never blocks the run.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use shopmirror_common::error::MirrorResult;
use shopmirror_common::types::ResourceType;
use shopmirror_db::sync::models::{SubSyncProgress, SyncRun};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const COMMAND_BUFFER: usize = 16;
const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub enum RunEvent {
    /// A sub-progress record changed.
    Sync(SyncRun),
    Running(SyncRun),
    Attached {
        resources: Vec<ResourceType>,
        run: SyncRun,
    },
    Success(SyncRun),
    Failed(SyncRun),
    Cancelled(SyncRun),
}

impl RunEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sync(_) => "sync",
            Self::Running(_) => "sync-running",
            Self::Attached { .. } => "sync-attach",
            Self::Success(_) => "sync-success",
            Self::Failed(_) => "sync-failed",
            Self::Cancelled(_) => "sync-cancelled",
        }
    }

    pub fn run(&self) -> &SyncRun {
        match self {
            Self::Sync(run)
            | Self::Running(run)
            | Self::Success(run)
            | Self::Failed(run)
            | Self::Cancelled(run) => run,
            Self::Attached { run, .. } => run,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success(_) | Self::Failed(_) | Self::Cancelled(_))
    }
}

#[derive(Debug)]
pub(crate) enum RunCommand {
    Ping(oneshot::Sender<()>),
    Attach {
        resources: Vec<ResourceType>,
        reply: oneshot::Sender<MirrorResult<SyncRun>>,
    },
}

/// Caller-side view of a live run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: Uuid,
    pub tenant: String,
    cancel: CancellationToken,
    orphaned: CancellationToken,
    commands: mpsc::Sender<RunCommand>,
    events: broadcast::Sender<RunEvent>,
    finished: watch::Receiver<Option<SyncRun>>,
}

/// Supervisor-side ends of a run's channels.
pub(crate) struct RunListeners {
    pub cancel: CancellationToken,
    /// Set once the run has been failed from outside; its state in storage is
    /// final and must not be written again.
    pub orphaned: CancellationToken,
    pub commands: mpsc::Receiver<RunCommand>,
    pub events: broadcast::Sender<RunEvent>,
    pub finished: watch::Sender<Option<SyncRun>>,
}

impl RunListeners {
    pub fn emit(&self, event: RunEvent) {
        tracing::debug!(
            run_id = %event.run().id,
            event = event.name(),
            "run event"
        );
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl RunHandle {
    pub(crate) fn channel(run_id: Uuid, tenant: &str) -> (Self, RunListeners) {
        let cancel = CancellationToken::new();
        let orphaned = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
        let (finished_tx, finished_rx) = watch::channel(None);

        let handle = Self {
            run_id,
            tenant: tenant.to_string(),
            cancel: cancel.clone(),
            orphaned: orphaned.clone(),
            commands: command_tx,
            events: event_tx.clone(),
            finished: finished_rx,
        };
        let listeners = RunListeners {
            cancel,
            orphaned,
            commands: command_rx,
            events: event_tx,
            finished: finished_tx,
        };
        (handle, listeners)
    }

    /// True when the supervisor answered within `timeout`.
    pub async fn ping(&self, timeout: Duration) -> bool {
        let (tx, rx) = oneshot::channel();
        let exchange = async {
            self.commands.send(RunCommand::Ping(tx)).await.ok()?;
            rx.await.ok()
        };
        matches!(tokio::time::timeout(timeout, exchange).await, Ok(Some(())))
    }

    /// Ask the run to also sync `resources`. `None` means the run is already
    /// wrapping up and can no longer take work.
    pub async fn attach(&self, resources: Vec<ResourceType>) -> Option<MirrorResult<SyncRun>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RunCommand::Attach { resources, reply })
            .await
            .ok()?;
        rx.await.ok()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Cancel the run and tell its supervisor that someone else has already
    /// recorded how it ended.
    pub fn orphan(&self) {
        self.orphaned.cancel();
        self.cancel.cancel();
    }

    pub fn is_orphaned(&self) -> bool {
        self.orphaned.is_cancelled()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    /// The final run, once the supervisor has persisted it. Waits forever when
    /// `timeout` is `None`; returns `None` on timeout or if the supervisor
    /// vanished without finishing.
    pub async fn wait_finished(&self, timeout: Option<Duration>) -> Option<SyncRun> {
        let mut finished = self.finished.clone();
        let wait = async move {
            let value = finished.wait_for(Option::is_some).await.ok()?;
            value.clone()
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.ok().flatten(),
            None => wait.await,
        }
    }
}

/// Live runs of this process, keyed by run id.
#[derive(Debug, Default)]
pub struct RunRegistry {
    handles: Mutex<HashMap<Uuid, RunHandle>>,
}

impl RunRegistry {
    pub fn register(&self, handle: RunHandle) {
        self.lock().insert(handle.run_id, handle);
    }

    pub fn get(&self, run_id: Uuid) -> Option<RunHandle> {
        self.lock().get(&run_id).cloned()
    }

    pub fn remove(&self, run_id: Uuid) -> Option<RunHandle> {
        self.lock().remove(&run_id)
    }

    pub fn handles(&self) -> Vec<RunHandle> {
        self.lock().values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RunHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// What a worker gets from its supervisor.
#[derive(Debug, Clone)]
pub struct WorkerSignals {
    pub cancel: CancellationToken,
    pub orphaned: CancellationToken,
    pub progress: mpsc::UnboundedSender<SubSyncProgress>,
}

impl WorkerSignals {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The run was failed from outside; nothing more may be written for it.
    pub fn is_orphaned(&self) -> bool {
        self.orphaned.is_cancelled()
    }

    pub fn report(&self, progress: &SubSyncProgress) {
        let _ = self.progress.send(progress.clone());
    }

    /// Sleep for `delay`, returning early if the run is cancelled.
    pub async fn pause(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.cancel.cancelled() => {}
        }
    }
}
