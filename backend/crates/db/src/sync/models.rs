use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shopmirror_common::types::ResourceType;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Starting,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for RunState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("unknown run state: {value}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProgressState {
    Starting,
    Running,
    Failed,
    Cancelling,
    Cancelled,
    Success,
}

impl ProgressState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Failed => "failed",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Success => "success",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Cancelled)
    }
}

impl FromStr for ProgressState {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "failed" => Ok(Self::Failed),
            "cancelling" => Ok(Self::Cancelling),
            "cancelled" => Ok(Self::Cancelled),
            "success" => Ok(Self::Success),
            _ => Err(format!("unknown progress state: {value}")),
        }
    }
}

/// What a run was asked to synchronise. Stored as JSONB on the run row.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RequestedResources {
    pub resources: BTreeSet<ResourceType>,
    /// Ignore prior progress and start every resource from the beginning.
    pub resync: bool,
    /// Also pull each order's transactions.
    pub include_transactions: bool,
}

impl RequestedResources {
    pub fn includes(&self, resource: ResourceType) -> bool {
        self.resources.contains(&resource)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubSyncProgress {
    pub id: Uuid,
    pub run_id: Uuid,
    pub tenant: String,
    pub resource_type: ResourceType,
    /// Remote total at the start of this run.
    pub shopify_count: i64,
    pub synced_count: i64,
    /// Resume after this remote id; 0 means from the beginning.
    pub since_id: i64,
    pub last_id: Option<i64>,
    pub info: Option<String>,
    pub state: ProgressState,
    pub error: Option<String>,
    pub continued_from: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubSyncProgress {
    /// A zeroed record in `starting`, not yet seeded by its worker.
    pub fn starting(run_id: Uuid, tenant: &str, resource_type: ResourceType) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            run_id,
            tenant: tenant.to_string(),
            resource_type,
            shopify_count: 0,
            synced_count: 0,
            since_id: 0,
            last_id: None,
            info: None,
            state: ProgressState::Starting,
            error: None,
            continued_from: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a later run may continue from this record. Unseeded records
    /// and failures that never reached a cursor carry no position.
    pub fn is_resume_source(&self) -> bool {
        match self.state {
            ProgressState::Starting => false,
            ProgressState::Failed => self.last_id.is_some(),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRun {
    pub id: Uuid,
    pub tenant: String,
    pub requested: RequestedResources,
    pub state: RunState,
    pub last_error: Option<String>,
    pub sub_progress: BTreeMap<ResourceType, SubSyncProgress>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncRun {
    /// A new run in `starting` with one unseeded sub-progress per requested resource.
    pub fn new(tenant: &str, requested: RequestedResources) -> Self {
        let id = Uuid::new_v4();
        let now = Utc::now();
        let sub_progress = requested
            .resources
            .iter()
            .map(|r| (*r, SubSyncProgress::starting(id, tenant, *r)))
            .collect();

        Self {
            id,
            tenant: tenant.to_string(),
            requested,
            state: RunState::Starting,
            last_error: None,
            sub_progress,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListRunsOptions {
    pub state: Option<RunState>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}
