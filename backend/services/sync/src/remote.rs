//! Capabilities the sync engine needs from the remote API.
//!
//! Each resource type is synchronised by the same worker; the difference
//! between resources lives entirely behind these traits.

use std::error::Error as StdError;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use shopmirror_common::types::ResourceType;

/// getaddrinfo's "temporary failure in name resolution".
pub const DNS_TRY_AGAIN: &str = "EAI_AGAIN";

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("HTTP {status}: {body}")]
    Http {
        status: StatusCode,
        body: String,
        retry_after: Option<Duration>,
    },

    #[error("request failed: {message}")]
    Network {
        code: Option<String>,
        message: String,
    },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl RemoteError {
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return Self::Decode(err.to_string());
        }
        Self::Network {
            code: dns_error_code(&err).map(str::to_string),
            message: err.to_string(),
        }
    }
}

/// Walk the source chain looking for a transient resolver failure.
fn dns_error_code(err: &(dyn StdError + 'static)) -> Option<&'static str> {
    let mut current = Some(err);
    while let Some(e) = current {
        let text = e.to_string().to_lowercase();
        if text.contains("eai_again") || text.contains("temporary failure in name resolution") {
            return Some(DNS_TRY_AGAIN);
        }
        current = e.source();
    }
    None
}

/// One remote item. Only the id and a display label are interpreted; the rest
/// is mirrored verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteItem {
    pub id: i64,
    pub label: Option<String>,
    pub payload: Value,
}

impl RemoteItem {
    pub fn from_json(resource: ResourceType, payload: Value) -> Result<Self, RemoteError> {
        let id = payload
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| RemoteError::Decode(format!("{resource} item without a numeric id")))?;

        let label = match payload.get(resource.label_field()) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(other) => Some(other.to_string()),
        };

        Ok(Self { id, label, payload })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based page number within the current run, for logging.
    pub page: u64,
    pub page_size: u32,
    /// Only items with an id greater than this are returned.
    pub since_id: i64,
}

#[async_trait]
pub trait Counter: Send + Sync {
    async fn count(&self, tenant: &str, resource: ResourceType) -> Result<u64, RemoteError>;
}

#[async_trait]
pub trait Pager: Send + Sync {
    /// Items in ascending id order, starting after `request.since_id`.
    async fn list_page(
        &self,
        tenant: &str,
        resource: ResourceType,
        request: &PageRequest,
    ) -> Result<Vec<RemoteItem>, RemoteError>;

    /// All items of a child collection belonging to one parent item.
    async fn list_children(
        &self,
        tenant: &str,
        child: ResourceType,
        parent_id: i64,
    ) -> Result<Vec<RemoteItem>, RemoteError>;
}
