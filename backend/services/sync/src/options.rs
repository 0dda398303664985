use std::collections::BTreeSet;

use shopmirror_common::types::ResourceType;
use shopmirror_db::sync::models::{RequestedResources, SyncRun};
use uuid::Uuid;

use crate::error::SyncError;

/// What a caller asks `start_sync` for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartSyncOptions {
    pub resources: BTreeSet<ResourceType>,
    pub resync: bool,
    pub include_transactions: bool,
    /// Add missing resources to a compatible live run instead of rejecting.
    pub attach_to_existing: bool,
    /// Cancel a conflicting live run and start over.
    pub cancel_existing: bool,
}

impl StartSyncOptions {
    pub fn new(resources: impl IntoIterator<Item = ResourceType>) -> Self {
        Self {
            resources: resources.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Every top-level resource type.
    pub fn all() -> Self {
        Self::new(ResourceType::TOP_LEVEL)
    }

    pub fn with_resync(mut self, resync: bool) -> Self {
        self.resync = resync;
        self
    }

    pub fn with_transactions(mut self, include: bool) -> Self {
        self.include_transactions = include;
        self
    }

    pub fn with_attach(mut self, attach: bool) -> Self {
        self.attach_to_existing = attach;
        self
    }

    pub fn with_cancel_existing(mut self, cancel: bool) -> Self {
        self.cancel_existing = cancel;
        self
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.resources.is_empty() {
            return Err(SyncError::Validation(
                "at least one resource type must be requested".into(),
            ));
        }
        if let Some(child) = self.resources.iter().find(|r| r.is_child()) {
            return Err(SyncError::Validation(format!(
                "{child} cannot be requested directly; it is synced with its parent"
            )));
        }
        Ok(())
    }

    pub fn requested(&self) -> RequestedResources {
        RequestedResources {
            resources: self.resources.clone(),
            resync: self.resync,
            include_transactions: self.include_transactions,
        }
    }
}

/// How `start_sync` satisfied a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Created,
    /// An identical or wider run was already going; its id is returned.
    Coalesced,
    /// These resources were added to the running run.
    Attached(Vec<ResourceType>),
    /// The previous run was cancelled and a new one created.
    Superseded { previous: Uuid },
}

#[derive(Debug, Clone)]
pub struct StartedSync {
    pub outcome: StartOutcome,
    pub run: SyncRun,
}
