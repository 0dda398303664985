use async_trait::async_trait;
use shopmirror_common::error::MirrorResult;
use shopmirror_common::types::ResourceType;

use crate::mirror::models::{MirroredRecord, UpsertResult};

#[async_trait]
pub trait MirrorRepository: Send + Sync {
    /// Replace-or-insert keyed by remote id. Applying the same batch twice
    /// leaves the stored content unchanged.
    async fn upsert_many(
        &self,
        tenant: &str,
        resource_type: ResourceType,
        records: &[MirroredRecord],
    ) -> MirrorResult<UpsertResult>;

    async fn find_by_id(
        &self,
        tenant: &str,
        resource_type: ResourceType,
        remote_id: i64,
    ) -> MirrorResult<Option<MirroredRecord>>;
}
