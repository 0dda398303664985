use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use shopmirror_common::error::MirrorResult;
use shopmirror_common::types::ResourceType;
use shopmirror_config::env::{get_var_or, parse_var_or};

use super::models::{items_from_envelope, CountResponse};
use crate::remote::{Counter, PageRequest, Pager, RemoteError, RemoteItem};

pub const DEFAULT_API_VERSION: &str = "2024-01";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct ShopifyClientConfig {
    pub access_token: String,
    pub api_version: String,
    /// Replaces `https://{tenant}` for every shop, e.g. a proxy or a test server.
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

impl ShopifyClientConfig {
    /// `Ok(None)` when no access token is configured.
    pub fn from_env() -> MirrorResult<Option<Self>> {
        let Ok(access_token) = std::env::var("SHOPIFY_ACCESS_TOKEN") else {
            return Ok(None);
        };
        let api_version = get_var_or("SHOPIFY_API_VERSION", DEFAULT_API_VERSION);
        let base_url = std::env::var("SHOPIFY_BASE_URL").ok();
        let timeout_secs = parse_var_or("SHOPIFY_TIMEOUT_SECS", DEFAULT_TIMEOUT_SECS)?;

        Ok(Some(Self {
            access_token,
            api_version,
            base_url,
            timeout_secs,
        }))
    }
}

/// Admin REST client. Every call is a single attempt; callers wrap it in
/// `retry::with_retry`.
#[derive(Clone)]
pub struct ShopifyClient {
    client: Client,
    config: ShopifyClientConfig,
}

impl ShopifyClient {
    pub fn new(config: ShopifyClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self { client, config })
    }

    fn api_root(&self, tenant: &str) -> String {
        let shop = match &self.config.base_url {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("https://{tenant}"),
        };
        format!("{shop}/admin/api/{}", self.config.api_version)
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value, RemoteError> {
        let response = self
            .client
            .get(url)
            .header("X-Shopify-Access-Token", &self.config.access_token)
            .query(query)
            .send()
            .await
            .map_err(RemoteError::from_reqwest)?;

        let status = response.status();
        if status.is_success() {
            return response.json::<Value>().await.map_err(RemoteError::from_reqwest);
        }

        let retry_after = if status == StatusCode::TOO_MANY_REQUESTS {
            response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64)
        } else {
            None
        };
        let body = response.text().await.unwrap_or_default();

        Err(RemoteError::Http {
            status,
            body,
            retry_after,
        })
    }
}

/// Orders default to `status=open`; a mirror wants all of them.
fn status_filter(resource: ResourceType) -> Option<(&'static str, String)> {
    (resource == ResourceType::Orders).then(|| ("status", "any".to_string()))
}

#[async_trait]
impl Counter for ShopifyClient {
    async fn count(&self, tenant: &str, resource: ResourceType) -> Result<u64, RemoteError> {
        let url = format!("{}/{}/count.json", self.api_root(tenant), resource.as_str());
        let query: Vec<_> = status_filter(resource).into_iter().collect();

        let body = self.get_json(&url, &query).await?;
        let parsed: CountResponse =
            serde_json::from_value(body).map_err(|e| RemoteError::Decode(e.to_string()))?;
        Ok(parsed.count)
    }
}

#[async_trait]
impl Pager for ShopifyClient {
    async fn list_page(
        &self,
        tenant: &str,
        resource: ResourceType,
        request: &PageRequest,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        let url = format!("{}/{}.json", self.api_root(tenant), resource.as_str());
        let mut query = vec![
            ("limit", request.page_size.to_string()),
            ("since_id", request.since_id.to_string()),
        ];
        query.extend(status_filter(resource));

        tracing::debug!(
            tenant,
            resource = %resource,
            page = request.page,
            since_id = request.since_id,
            "fetching page"
        );
        let body = self.get_json(&url, &query).await?;
        items_from_envelope(resource, body)
    }

    async fn list_children(
        &self,
        tenant: &str,
        child: ResourceType,
        parent_id: i64,
    ) -> Result<Vec<RemoteItem>, RemoteError> {
        let parent = child.parent().ok_or_else(|| {
            RemoteError::Decode(format!("{child} is not a child collection"))
        })?;
        let url = format!(
            "{}/{}/{}/{}.json",
            self.api_root(tenant),
            parent.as_str(),
            parent_id,
            child.as_str()
        );

        let body = self.get_json(&url, &[]).await?;
        items_from_envelope(child, body)
    }
}
