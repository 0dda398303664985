use std::str::FromStr;

use async_trait::async_trait;
use shopmirror_common::error::{MirrorError, MirrorResult};
use shopmirror_common::types::ResourceType;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, QueryBuilder, Row};

use crate::mirror::models::{latest_per_remote_id, MirroredRecord, UpsertResult};
use crate::mirror::repositories::MirrorRepository;

#[derive(Clone)]
pub struct PgMirrorRepository {
    pool: PgPool,
}

impl PgMirrorRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: PgRow) -> MirrorResult<MirroredRecord> {
        let resource_raw: String = row.get("resource_type");
        let resource_type = ResourceType::from_str(&resource_raw).map_err(MirrorError::Internal)?;

        Ok(MirroredRecord {
            tenant: row.get("tenant"),
            resource_type,
            remote_id: row.get("remote_id"),
            parent_id: row.get("parent_id"),
            label: row.get("label"),
            payload: row.get("payload"),
            synced_at: row.get("synced_at"),
        })
    }
}

#[async_trait]
impl MirrorRepository for PgMirrorRepository {
    async fn upsert_many(
        &self,
        tenant: &str,
        resource_type: ResourceType,
        records: &[MirroredRecord],
    ) -> MirrorResult<UpsertResult> {
        // Postgres rejects a batch that touches the same conflict key twice.
        let unique = latest_per_remote_id(records);
        if unique.is_empty() {
            return Ok(UpsertResult::default());
        }

        let mut qb = QueryBuilder::new(
            "insert into mirrored_records
             (tenant, resource_type, remote_id, parent_id, label, payload, synced_at) ",
        );
        qb.push_values(unique.iter(), |mut b, record| {
            b.push_bind(tenant)
                .push_bind(resource_type.as_str())
                .push_bind(record.remote_id)
                .push_bind(record.parent_id)
                .push_bind(&record.label)
                .push_bind(&record.payload)
                .push_bind(record.synced_at);
        });
        qb.push(
            " on conflict (tenant, resource_type, remote_id) do update set
               parent_id = excluded.parent_id,
               label = excluded.label,
               payload = excluded.payload,
               synced_at = excluded.synced_at",
        );

        qb.build()
            .execute(&self.pool)
            .await
            .map_err(|e| MirrorError::Database(e.to_string()))?;

        Ok(UpsertResult {
            upserted: unique.len(),
        })
    }

    async fn find_by_id(
        &self,
        tenant: &str,
        resource_type: ResourceType,
        remote_id: i64,
    ) -> MirrorResult<Option<MirroredRecord>> {
        let row = sqlx::query(
            "select tenant, resource_type, remote_id, parent_id, label, payload, synced_at
             from mirrored_records
             where tenant = $1 and resource_type = $2 and remote_id = $3",
        )
        .bind(tenant)
        .bind(resource_type.as_str())
        .bind(remote_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MirrorError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }
}
