use serde::Deserialize;
use serde_json::Value;
use shopmirror_common::types::ResourceType;

use crate::remote::{RemoteError, RemoteItem};

/// Body of `GET /{resource}/count.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

/// Unwrap a list response of the form `{"<envelope>": [ ... ]}`.
pub fn items_from_envelope(
    resource: ResourceType,
    mut body: Value,
) -> Result<Vec<RemoteItem>, RemoteError> {
    let envelope = resource.envelope();
    let items = match body.get_mut(envelope).map(Value::take) {
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(RemoteError::Decode(format!(
                "expected `{envelope}` to be an array, got {other}"
            )))
        }
        None => {
            return Err(RemoteError::Decode(format!(
                "response has no `{envelope}` field"
            )))
        }
    };

    items
        .into_iter()
        .map(|item| RemoteItem::from_json(resource, item))
        .collect()
}
