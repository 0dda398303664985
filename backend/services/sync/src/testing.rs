//! In-memory collaborators for worker and orchestrator tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use shopmirror_common::error::{MirrorError, MirrorResult};
use shopmirror_common::types::ResourceType;
use shopmirror_db::sync::models::{ListRunsOptions, SubSyncProgress, SyncRun};
use shopmirror_db::sync::repositories::ProgressRepository;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SyncSettings;
use crate::remote::{Counter, PageRequest, Pager, RemoteError, RemoteItem};
use crate::retry::RetryPolicy;
use crate::store::Upserter;
use crate::worker::SyncDeps;

pub const TENANT: &str = "demo.myshopify.com";

pub fn test_settings() -> SyncSettings {
    SyncSettings {
        page_size: 250,
        page_delay: Duration::ZERO,
        liveness_timeout: Duration::from_millis(200),
        cancel_timeout: Duration::from_secs(2),
        retry: RetryPolicy {
            max_retries: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(5),
            ..RetryPolicy::default()
        },
    }
}

pub fn http_error(status: u16) -> RemoteError {
    RemoteError::Http {
        status: reqwest::StatusCode::from_u16(status).unwrap(),
        body: format!("status {status}"),
        retry_after: None,
    }
}

#[derive(Default)]
struct RemoteState {
    items: HashMap<ResourceType, Vec<i64>>,
    counts: HashMap<ResourceType, u64>,
    count_failures: HashMap<ResourceType, VecDeque<RemoteError>>,
    page_failures: HashMap<ResourceType, VecDeque<RemoteError>>,
    children: HashMap<i64, Vec<i64>>,
    page_calls: Vec<(ResourceType, PageRequest)>,
    child_calls: Vec<i64>,
    cancel_after: Option<(ResourceType, usize, CancellationToken)>,
    stuck_pages: bool,
}

/// Remote collections whose items have ascending integer ids.
#[derive(Default)]
pub struct FakeRemote {
    state: Mutex<RemoteState>,
    page_latency: Mutex<Duration>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Items with ids `1..=n`.
    pub fn with_items(self, resource: ResourceType, n: i64) -> Self {
        self.with_ids(resource, (1..=n).collect())
    }

    pub fn with_ids(self, resource: ResourceType, mut ids: Vec<i64>) -> Self {
        ids.sort_unstable();
        self.state.lock().unwrap().items.insert(resource, ids);
        self
    }

    /// Report a total that differs from the number of items served.
    pub fn with_count(self, resource: ResourceType, count: u64) -> Self {
        self.state.lock().unwrap().counts.insert(resource, count);
        self
    }

    pub fn with_children(self, parent_id: i64, ids: Vec<i64>) -> Self {
        self.state.lock().unwrap().children.insert(parent_id, ids);
        self
    }

    pub fn with_page_latency(self, latency: Duration) -> Self {
        *self.page_latency.lock().unwrap() = latency;
        self
    }

    pub fn fail_count(self, resource: ResourceType, err: RemoteError) -> Self {
        self.state
            .lock()
            .unwrap()
            .count_failures
            .entry(resource)
            .or_default()
            .push_back(err);
        self
    }

    pub fn fail_page(self, resource: ResourceType, err: RemoteError) -> Self {
        self.state
            .lock()
            .unwrap()
            .page_failures
            .entry(resource)
            .or_default()
            .push_back(err);
        self
    }

    /// Cancel `token` once `pages` pages of `resource` have been served.
    pub fn cancel_after_pages(self, resource: ResourceType, pages: usize, token: CancellationToken) -> Self {
        self.state.lock().unwrap().cancel_after = Some((resource, pages, token));
        self
    }

    /// Serve pages that ignore `since_id`.
    pub fn with_stuck_pages(self) -> Self {
        self.state.lock().unwrap().stuck_pages = true;
        self
    }

    pub fn add_items(&self, resource: ResourceType, ids: impl IntoIterator<Item = i64>) {
        let mut state = self.state.lock().unwrap();
        let list = state.items.entry(resource).or_default();
        list.extend(ids);
        list.sort_unstable();
    }

    pub fn page_calls(&self, resource: ResourceType) -> Vec<PageRequest> {
        self.state
            .lock()
            .unwrap()
            .page_calls
            .iter()
            .filter(|(r, _)| *r == resource)
            .map(|(_, req)| *req)
            .collect()
    }

    pub fn child_calls(&self) -> Vec<i64> {
        self.state.lock().unwrap().child_calls.clone()
    }

    fn item(resource: ResourceType, id: i64) -> RemoteItem {
        RemoteItem {
            id,
            label: Some(format!("{resource} #{id}")),
            payload: serde_json::json!({ "id": id }),
        }
    }
}

#[async_trait]
impl Counter for FakeRemote {
    async fn count(&self, _tenant: &str, resource: ResourceType) -> Result<u64, RemoteError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state
            .count_failures
            .get_mut(&resource)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }
        if let Some(count) = state.counts.get(&resource) {
            return Ok(*count);
        }
        Ok(state.items.get(&resource).map_or(0, |ids| ids.len() as u64))
    }
}

#[async_trait]
impl Pager for FakeRemote {
    async fn list_page(
        &self,
        _tenant: &str,
        resource: ResourceType,
        request: &PageRequest,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        let latency = *self.page_latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().unwrap();
        state.page_calls.push((resource, *request));
        if let Some(err) = state
            .page_failures
            .get_mut(&resource)
            .and_then(VecDeque::pop_front)
        {
            return Err(err);
        }

        let since_id = if state.stuck_pages { 0 } else { request.since_id };
        let page: Vec<RemoteItem> = state
            .items
            .get(&resource)
            .map(|ids| {
                ids.iter()
                    .filter(|id| **id > since_id)
                    .take(request.page_size as usize)
                    .map(|id| Self::item(resource, *id))
                    .collect()
            })
            .unwrap_or_default();

        let served = state
            .page_calls
            .iter()
            .filter(|(r, _)| *r == resource)
            .count();
        if let Some((target, pages, token)) = &state.cancel_after {
            if *target == resource && served >= *pages {
                token.cancel();
            }
        }

        Ok(page)
    }

    async fn list_children(
        &self,
        _tenant: &str,
        child: ResourceType,
        parent_id: i64,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.child_calls.push(parent_id);
        Ok(state
            .children
            .get(&parent_id)
            .map(|ids| ids.iter().map(|id| Self::item(child, *id)).collect())
            .unwrap_or_default())
    }
}

/// Mirror keyed by (resource, remote id), remembering each item's parent.
#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<BTreeMap<(ResourceType, i64), (Option<i64>, RemoteItem)>>,
    writes: Mutex<usize>,
}

impl MemoryStore {
    pub fn count(&self, resource: ResourceType) -> usize {
        self.items
            .lock()
            .unwrap()
            .keys()
            .filter(|(r, _)| *r == resource)
            .count()
    }

    pub fn parent_of(&self, resource: ResourceType, id: i64) -> Option<i64> {
        self.items
            .lock()
            .unwrap()
            .get(&(resource, id))
            .and_then(|(parent, _)| *parent)
    }

    pub fn writes(&self) -> usize {
        *self.writes.lock().unwrap()
    }
}

#[async_trait]
impl Upserter for MemoryStore {
    async fn upsert_many(
        &self,
        _tenant: &str,
        resource: ResourceType,
        parent_id: Option<i64>,
        items: &[RemoteItem],
    ) -> MirrorResult<usize> {
        let mut stored = self.items.lock().unwrap();
        for item in items {
            stored.insert((resource, item.id), (parent_id, item.clone()));
        }
        *self.writes.lock().unwrap() += 1;
        Ok(items.len())
    }
}

#[derive(Default)]
struct RepoState {
    /// Insertion order doubles as creation order.
    runs: Vec<SyncRun>,
    progress_log: Vec<SubSyncProgress>,
    failing_progress_saves: usize,
    failing_progress_lookups: usize,
}

#[derive(Default)]
pub struct MemoryProgressRepo {
    state: Mutex<RepoState>,
}

impl MemoryProgressRepo {
    /// Store a run as-is, e.g. one left behind by a previous process.
    pub fn insert_run(&self, run: SyncRun) {
        self.state.lock().unwrap().runs.push(run);
    }

    /// Make the next `n` progress writes fail with a database error.
    pub fn fail_progress_saves(&self, n: usize) {
        self.state.lock().unwrap().failing_progress_saves = n;
    }

    /// Make the next `n` resume lookups fail with a database error.
    pub fn fail_progress_lookups(&self, n: usize) {
        self.state.lock().unwrap().failing_progress_lookups = n;
    }

    pub fn run(&self, run_id: Uuid) -> Option<SyncRun> {
        self.state
            .lock()
            .unwrap()
            .runs
            .iter()
            .find(|r| r.id == run_id)
            .cloned()
    }

    pub fn run_count(&self) -> usize {
        self.state.lock().unwrap().runs.len()
    }

    /// Every successful progress write, in order.
    pub fn progress_log(&self, run_id: Uuid, resource: ResourceType) -> Vec<SubSyncProgress> {
        self.state
            .lock()
            .unwrap()
            .progress_log
            .iter()
            .filter(|p| p.run_id == run_id && p.resource_type == resource)
            .cloned()
            .collect()
    }

    /// Poll until `check` holds for the stored run.
    pub async fn wait_until(&self, run_id: Uuid, check: impl Fn(&SyncRun) -> bool) -> SyncRun {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(run) = self.run(run_id) {
                if check(&run) {
                    return run;
                }
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "condition not reached for run {run_id}"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ProgressRepository for MemoryProgressRepo {
    async fn create_run(&self, run: &SyncRun) -> MirrorResult<SyncRun> {
        self.state.lock().unwrap().runs.push(run.clone());
        Ok(run.clone())
    }

    async fn save_run(&self, run: &SyncRun) -> MirrorResult<()> {
        let mut state = self.state.lock().unwrap();
        let stored = state
            .runs
            .iter_mut()
            .find(|r| r.id == run.id)
            .ok_or_else(|| MirrorError::NotFound(format!("run {}", run.id)))?;
        stored.requested = run.requested.clone();
        stored.state = run.state;
        stored.last_error = run.last_error.clone();
        stored.updated_at = run.updated_at;
        Ok(())
    }

    async fn save_progress(&self, progress: &SubSyncProgress) -> MirrorResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.failing_progress_saves > 0 {
            state.failing_progress_saves -= 1;
            return Err(MirrorError::Database("connection reset by peer".into()));
        }
        let stored = state
            .runs
            .iter_mut()
            .find(|r| r.id == progress.run_id)
            .ok_or_else(|| MirrorError::NotFound(format!("run {}", progress.run_id)))?;
        stored
            .sub_progress
            .insert(progress.resource_type, progress.clone());
        state.progress_log.push(progress.clone());
        Ok(())
    }

    async fn find_run(&self, tenant: &str, run_id: Uuid) -> MirrorResult<Option<SyncRun>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .runs
            .iter()
            .find(|r| r.id == run_id && r.tenant == tenant)
            .cloned())
    }

    async fn find_latest_run(&self, tenant: &str) -> MirrorResult<Option<SyncRun>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .runs
            .iter()
            .rev()
            .find(|r| r.tenant == tenant)
            .cloned())
    }

    async fn list_runs(&self, tenant: &str, options: ListRunsOptions) -> MirrorResult<Vec<SyncRun>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|r| r.tenant == tenant)
            .filter(|r| options.state.map_or(true, |s| r.state == s))
            .skip(options.offset.unwrap_or(0) as usize)
            .take(options.limit.unwrap_or(50) as usize)
            .cloned()
            .collect())
    }

    async fn find_latest_progress(
        &self,
        tenant: &str,
        resource_type: ResourceType,
        exclude_run: Option<Uuid>,
    ) -> MirrorResult<Option<SubSyncProgress>> {
        let mut state = self.state.lock().unwrap();
        if state.failing_progress_lookups > 0 {
            state.failing_progress_lookups -= 1;
            return Err(MirrorError::Database("connection reset by peer".into()));
        }
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|r| r.tenant == tenant && Some(r.id) != exclude_run)
            .filter_map(|r| r.sub_progress.get(&resource_type))
            .find(|p| p.is_resume_source())
            .cloned())
    }
}

pub struct Harness {
    pub remote: Arc<FakeRemote>,
    pub repo: Arc<MemoryProgressRepo>,
    pub store: Arc<MemoryStore>,
}

impl Harness {
    pub fn new(remote: FakeRemote) -> Self {
        Self {
            remote: Arc::new(remote),
            repo: Arc::new(MemoryProgressRepo::default()),
            store: Arc::new(MemoryStore::default()),
        }
    }

    pub fn deps(&self) -> SyncDeps {
        SyncDeps {
            counter: self.remote.clone(),
            pager: self.remote.clone(),
            upserter: self.store.clone(),
            progress: self.repo.clone(),
        }
    }
}
