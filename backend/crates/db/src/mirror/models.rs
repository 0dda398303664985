use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shopmirror_common::types::ResourceType;

/// One remote item as stored locally, keyed by (tenant, resource_type, remote_id).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MirroredRecord {
    pub tenant: String,
    pub resource_type: ResourceType,
    pub remote_id: i64,
    /// Remote id of the owning item for child collections.
    pub parent_id: Option<i64>,
    pub label: Option<String>,
    pub payload: serde_json::Value,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertResult {
    pub upserted: usize,
}

/// The write set of a batch: one record per remote id, the last occurrence
/// winning, ordered by id.
pub fn latest_per_remote_id(records: &[MirroredRecord]) -> Vec<&MirroredRecord> {
    let unique: BTreeMap<i64, &MirroredRecord> = records.iter().map(|r| (r.remote_id, r)).collect();
    unique.into_values().collect()
}
