use std::collections::{BTreeMap, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use chrono::Utc;
use shopmirror_common::error::{MirrorError, MirrorResult};
use shopmirror_common::types::ResourceType;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use uuid::Uuid;

use crate::sync::models::{
    ListRunsOptions, ProgressState, RequestedResources, RunState, SubSyncProgress, SyncRun,
};
use crate::sync::repositories::ProgressRepository;

const RUN_COLUMNS: &str = "id, tenant, requested, state, last_error, created_at, updated_at";

const PROGRESS_COLUMNS: &str = "id, run_id, tenant, resource_type, shopify_count, synced_count, \
     since_id, last_id, info, state, error, continued_from, created_at, updated_at";

#[derive(Clone)]
pub struct PgProgressRepository {
    pool: PgPool,
}

impl PgProgressRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run row without sub-progress; callers attach it via `load_progress`.
    fn map_run_row(row: PgRow) -> MirrorResult<SyncRun> {
        let requested_raw: serde_json::Value = row.get("requested");
        let requested: RequestedResources = serde_json::from_value(requested_raw)
            .map_err(|e| MirrorError::Internal(format!("invalid requested resources: {e}")))?;
        let state_raw: String = row.get("state");
        let state = RunState::from_str(&state_raw).map_err(MirrorError::Internal)?;

        Ok(SyncRun {
            id: row.get("id"),
            tenant: row.get("tenant"),
            requested,
            state,
            last_error: row.get("last_error"),
            sub_progress: BTreeMap::new(),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    fn map_progress_row(row: PgRow) -> MirrorResult<SubSyncProgress> {
        let resource_raw: String = row.get("resource_type");
        let resource_type = ResourceType::from_str(&resource_raw).map_err(MirrorError::Internal)?;
        let state_raw: String = row.get("state");
        let state = ProgressState::from_str(&state_raw).map_err(MirrorError::Internal)?;

        Ok(SubSyncProgress {
            id: row.get("id"),
            run_id: row.get("run_id"),
            tenant: row.get("tenant"),
            resource_type,
            shopify_count: row.get("shopify_count"),
            synced_count: row.get("synced_count"),
            since_id: row.get("since_id"),
            last_id: row.get("last_id"),
            info: row.get("info"),
            state,
            error: row.get("error"),
            continued_from: row.get("continued_from"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn load_progress(&self, runs: &mut [SyncRun]) -> MirrorResult<()> {
        if runs.is_empty() {
            return Ok(());
        }
        let ids: Vec<Uuid> = runs.iter().map(|r| r.id).collect();

        let rows = sqlx::query(&format!(
            "select {PROGRESS_COLUMNS} from sync_sub_progress where run_id = any($1)"
        ))
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| MirrorError::Database(e.to_string()))?;

        let mut by_run: HashMap<Uuid, Vec<SubSyncProgress>> = HashMap::new();
        for row in rows {
            let progress = Self::map_progress_row(row)?;
            by_run.entry(progress.run_id).or_default().push(progress);
        }

        for run in runs.iter_mut() {
            for progress in by_run.remove(&run.id).unwrap_or_default() {
                run.sub_progress.insert(progress.resource_type, progress);
            }
        }
        Ok(())
    }

    async fn insert_progress(
        tx: &mut Transaction<'_, Postgres>,
        progress: &SubSyncProgress,
    ) -> MirrorResult<()> {
        sqlx::query(
            "insert into sync_sub_progress
             (id, run_id, tenant, resource_type, shopify_count, synced_count, since_id,
              last_id, info, state, error, continued_from, created_at, updated_at)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(progress.id)
        .bind(progress.run_id)
        .bind(&progress.tenant)
        .bind(progress.resource_type.as_str())
        .bind(progress.shopify_count)
        .bind(progress.synced_count)
        .bind(progress.since_id)
        .bind(progress.last_id)
        .bind(&progress.info)
        .bind(progress.state.as_str())
        .bind(&progress.error)
        .bind(progress.continued_from)
        .bind(progress.created_at)
        .bind(progress.updated_at)
        .execute(&mut **tx)
        .await
        .map_err(|e| MirrorError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ProgressRepository for PgProgressRepository {
    async fn create_run(&self, run: &SyncRun) -> MirrorResult<SyncRun> {
        let requested = serde_json::to_value(&run.requested)
            .map_err(|e| MirrorError::Internal(e.to_string()))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MirrorError::Database(e.to_string()))?;

        sqlx::query(
            "insert into sync_runs (id, tenant, requested, state, last_error, created_at, updated_at)
             values ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(run.id)
        .bind(&run.tenant)
        .bind(&requested)
        .bind(run.state.as_str())
        .bind(&run.last_error)
        .bind(run.created_at)
        .bind(run.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| MirrorError::Database(e.to_string()))?;

        for progress in run.sub_progress.values() {
            Self::insert_progress(&mut tx, progress).await?;
        }

        tx.commit()
            .await
            .map_err(|e| MirrorError::Database(e.to_string()))?;

        Ok(run.clone())
    }

    async fn save_run(&self, run: &SyncRun) -> MirrorResult<()> {
        let requested = serde_json::to_value(&run.requested)
            .map_err(|e| MirrorError::Internal(e.to_string()))?;

        let result = sqlx::query(
            "update sync_runs
             set requested = $1, state = $2, last_error = $3, updated_at = $4
             where id = $5",
        )
        .bind(&requested)
        .bind(run.state.as_str())
        .bind(&run.last_error)
        .bind(Utc::now())
        .bind(run.id)
        .execute(&self.pool)
        .await
        .map_err(|e| MirrorError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(MirrorError::NotFound(format!("sync run not found: {}", run.id)));
        }
        Ok(())
    }

    async fn save_progress(&self, progress: &SubSyncProgress) -> MirrorResult<()> {
        sqlx::query(
            "insert into sync_sub_progress
             (id, run_id, tenant, resource_type, shopify_count, synced_count, since_id,
              last_id, info, state, error, continued_from, created_at, updated_at)
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             on conflict (run_id, resource_type) do update set
               shopify_count = excluded.shopify_count,
               synced_count = excluded.synced_count,
               since_id = excluded.since_id,
               last_id = excluded.last_id,
               info = excluded.info,
               state = excluded.state,
               error = excluded.error,
               continued_from = excluded.continued_from,
               updated_at = excluded.updated_at",
        )
        .bind(progress.id)
        .bind(progress.run_id)
        .bind(&progress.tenant)
        .bind(progress.resource_type.as_str())
        .bind(progress.shopify_count)
        .bind(progress.synced_count)
        .bind(progress.since_id)
        .bind(progress.last_id)
        .bind(&progress.info)
        .bind(progress.state.as_str())
        .bind(&progress.error)
        .bind(progress.continued_from)
        .bind(progress.created_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| MirrorError::Database(e.to_string()))?;
        Ok(())
    }

    async fn find_run(&self, tenant: &str, run_id: Uuid) -> MirrorResult<Option<SyncRun>> {
        let row = sqlx::query(&format!(
            "select {RUN_COLUMNS} from sync_runs where tenant = $1 and id = $2"
        ))
        .bind(tenant)
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MirrorError::Database(e.to_string()))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut runs = vec![Self::map_run_row(row)?];
        self.load_progress(&mut runs).await?;
        Ok(runs.pop())
    }

    async fn find_latest_run(&self, tenant: &str) -> MirrorResult<Option<SyncRun>> {
        let mut runs = self
            .list_runs(
                tenant,
                ListRunsOptions {
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .await?;
        Ok(runs.pop())
    }

    async fn list_runs(
        &self,
        tenant: &str,
        options: ListRunsOptions,
    ) -> MirrorResult<Vec<SyncRun>> {
        let mut qb = QueryBuilder::new(format!("select {RUN_COLUMNS} from sync_runs where tenant = "));
        qb.push_bind(tenant);

        if let Some(state) = options.state {
            qb.push(" and state = ").push_bind(state.as_str());
        }

        qb.push(" order by created_at desc");
        qb.push(" limit ").push_bind(options.limit.unwrap_or(50));
        qb.push(" offset ").push_bind(options.offset.unwrap_or(0));

        let rows = qb
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MirrorError::Database(e.to_string()))?;

        let mut runs = rows
            .into_iter()
            .map(Self::map_run_row)
            .collect::<MirrorResult<Vec<_>>>()?;
        self.load_progress(&mut runs).await?;
        Ok(runs)
    }

    async fn find_latest_progress(
        &self,
        tenant: &str,
        resource_type: ResourceType,
        exclude_run: Option<Uuid>,
    ) -> MirrorResult<Option<SubSyncProgress>> {
        let row = sqlx::query(
            "select p.id, p.run_id, p.tenant, p.resource_type, p.shopify_count, p.synced_count,
                    p.since_id, p.last_id, p.info, p.state, p.error, p.continued_from,
                    p.created_at, p.updated_at
             from sync_sub_progress p
             join sync_runs r on r.id = p.run_id
             where p.tenant = $1
               and p.resource_type = $2
               and p.state <> 'starting'
               and not (p.state = 'failed' and p.last_id is null)
               and ($3::uuid is null or p.run_id <> $3)
             order by r.created_at desc, p.updated_at desc
             limit 1",
        )
        .bind(tenant)
        .bind(resource_type.as_str())
        .bind(exclude_run)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MirrorError::Database(e.to_string()))?;

        row.map(Self::map_progress_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::RequestedResources;
    use crate::{create_pool, migrate};

    async fn test_repo() -> Option<PgProgressRepository> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = create_pool(&url).await.expect("db should connect");
        migrate(&pool).await.ok()?;
        Some(PgProgressRepository::new(pool))
    }

    fn requested(resources: &[ResourceType]) -> RequestedResources {
        RequestedResources {
            resources: resources.iter().copied().collect(),
            resync: false,
            include_transactions: false,
        }
    }

    fn tenant() -> String {
        format!("{}.myshopify.com", Uuid::new_v4())
    }

    #[tokio::test]
    async fn create_run_persists_sub_progress() {
        let Some(repo) = test_repo().await else {
            return;
        };
        let tenant = tenant();
        let run = SyncRun::new(&tenant, requested(&[ResourceType::Orders, ResourceType::Pages]));
        repo.create_run(&run).await.expect("create");

        let found = repo
            .find_run(&tenant, run.id)
            .await
            .expect("find")
            .expect("run should exist");
        assert_eq!(found.state, RunState::Starting);
        assert_eq!(found.sub_progress.len(), 2);
        assert_eq!(found.requested, run.requested);
    }

    #[tokio::test]
    async fn latest_run_is_newest() {
        let Some(repo) = test_repo().await else {
            return;
        };
        let tenant = tenant();
        let first = SyncRun::new(&tenant, requested(&[ResourceType::Orders]));
        repo.create_run(&first).await.expect("first");
        let mut second = SyncRun::new(&tenant, requested(&[ResourceType::Products]));
        second.created_at = first.created_at + chrono::Duration::seconds(1);
        repo.create_run(&second).await.expect("second");

        let latest = repo.find_latest_run(&tenant).await.expect("latest").unwrap();
        assert_eq!(latest.id, second.id);

        let runs = repo.list_runs(&tenant, ListRunsOptions::default()).await.expect("list");
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[1].id, first.id);
    }

    #[tokio::test]
    async fn save_run_updates_state_and_error() {
        let Some(repo) = test_repo().await else {
            return;
        };
        let tenant = tenant();
        let mut run = SyncRun::new(&tenant, requested(&[ResourceType::Orders]));
        repo.create_run(&run).await.expect("create");

        run.state = RunState::Failed;
        run.last_error = Some("orders:HTTP 500".to_string());
        repo.save_run(&run).await.expect("save");

        let found = repo.find_run(&tenant, run.id).await.unwrap().unwrap();
        assert_eq!(found.state, RunState::Failed);
        assert_eq!(found.last_error.as_deref(), Some("orders:HTTP 500"));
    }

    #[tokio::test]
    async fn latest_progress_skips_unpositioned_and_excluded_runs() {
        let Some(repo) = test_repo().await else {
            return;
        };
        let tenant = tenant();
        let old = SyncRun::new(&tenant, requested(&[ResourceType::Orders]));
        repo.create_run(&old).await.expect("old");
        let mut seeded = old.sub_progress[&ResourceType::Orders].clone();
        seeded.state = ProgressState::Cancelled;
        seeded.synced_count = 250;
        seeded.last_id = Some(250);
        seeded.since_id = 250;
        repo.save_progress(&seeded).await.expect("save");

        let mut current = SyncRun::new(&tenant, requested(&[ResourceType::Orders]));
        current.created_at = old.created_at + chrono::Duration::seconds(1);
        repo.create_run(&current).await.expect("current");

        let found = repo
            .find_latest_progress(&tenant, ResourceType::Orders, Some(current.id))
            .await
            .expect("query")
            .expect("progress should exist");
        assert_eq!(found.run_id, old.id);
        assert_eq!(found.last_id, Some(250));

        // A failure that never got a cursor is not a place to resume from.
        let mut failed = current.sub_progress[&ResourceType::Orders].clone();
        failed.state = ProgressState::Failed;
        failed.error = Some("database error: connection reset".to_string());
        repo.save_progress(&failed).await.expect("save failed");
        let found = repo
            .find_latest_progress(&tenant, ResourceType::Orders, None)
            .await
            .expect("query")
            .expect("progress should exist");
        assert_eq!(found.run_id, old.id);

        let none = repo
            .find_latest_progress(&tenant, ResourceType::Pages, None)
            .await
            .expect("query");
        assert!(none.is_none());
    }
}
