use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use shopmirror_common::error::MirrorResult;
use shopmirror_common::types::ResourceType;
use shopmirror_db::mirror::models::MirroredRecord;
use shopmirror_db::mirror::repositories::MirrorRepository;

use crate::remote::RemoteItem;

/// Write side of the local mirror as seen by a worker.
#[async_trait]
pub trait Upserter: Send + Sync {
    /// Insert or replace `items`; returns how many distinct ids were written.
    async fn upsert_many(
        &self,
        tenant: &str,
        resource: ResourceType,
        parent_id: Option<i64>,
        items: &[RemoteItem],
    ) -> MirrorResult<usize>;
}

pub struct StoreUpserter<R> {
    repo: Arc<R>,
}

impl<R: MirrorRepository> StoreUpserter<R> {
    pub fn new(repo: Arc<R>) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl<R: MirrorRepository + 'static> Upserter for StoreUpserter<R> {
    async fn upsert_many(
        &self,
        tenant: &str,
        resource: ResourceType,
        parent_id: Option<i64>,
        items: &[RemoteItem],
    ) -> MirrorResult<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        let synced_at = Utc::now();
        let records: Vec<MirroredRecord> = items
            .iter()
            .map(|item| MirroredRecord {
                tenant: tenant.to_string(),
                resource_type: resource,
                remote_id: item.id,
                parent_id,
                label: item.label.clone(),
                payload: item.payload.clone(),
                synced_at,
            })
            .collect();

        let result = self.repo.upsert_many(tenant, resource, &records).await?;
        tracing::debug!(
            tenant,
            resource = %resource,
            upserted = result.upserted,
            "mirrored batch"
        );
        Ok(result.upserted)
    }
}
