//! Account-service seam: API key resolution and the typed key cache.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared::cache::{CacheError, LayeredCache, RemoteCache};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

const API_KEY_CACHE_CAPACITY: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApiKeyRole {
    Sdk,
    Service,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: String,
    pub role: ApiKeyRole,
    #[serde(default)]
    pub disabled: bool,
}

/// An API key resolved to its environment. `environment_disabled` is the
/// tenant-level kill switch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentApiKey {
    pub environment_namespace: String,
    pub api_key: ApiKey,
    #[serde(default)]
    pub environment_disabled: bool,
}

#[derive(Error, Debug)]
pub enum AccountClientError {
    #[error("Not found")]
    NotFound,
    #[error("Account service unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait AccountClient: Send + Sync {
    /// Resolves an API key id across all environments.
    async fn get_environment_api_key(
        &self,
        api_key_id: &str,
    ) -> Result<EnvironmentApiKey, AccountClientError>;
}

#[derive(Serialize)]
struct GetEnvironmentApiKeyRequest<'a> {
    id: &'a str,
}

#[derive(Deserialize)]
struct GetEnvironmentApiKeyResponse {
    environment_api_key: EnvironmentApiKey,
}

pub struct HttpAccountClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccountClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl AccountClient for HttpAccountClient {
    async fn get_environment_api_key(
        &self,
        api_key_id: &str,
    ) -> Result<EnvironmentApiKey, AccountClientError> {
        let url = format!("{}/v1/account/environment_api_key", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&GetEnvironmentApiKeyRequest { id: api_key_id })
            .send()
            .await
            .map_err(|e| AccountClientError::Unavailable(e.to_string()))?;

        match response.status() {
            status if status.is_success() => response
                .json::<GetEnvironmentApiKeyResponse>()
                .await
                .map(|r| r.environment_api_key)
                .map_err(|e| AccountClientError::Unavailable(e.to_string())),
            reqwest::StatusCode::NOT_FOUND => Err(AccountClientError::NotFound),
            status => Err(AccountClientError::Unavailable(format!(
                "HTTP {status} from {url}"
            ))),
        }
    }
}

/// API key lookups sit on the hot path of every SDK call, so resolved keys
/// are cached keyed `environment_api_key:{key_id}`.
pub struct EnvironmentApiKeyCache {
    inner: LayeredCache<EnvironmentApiKey>,
}

impl EnvironmentApiKeyCache {
    pub fn new(remote: Arc<dyn RemoteCache>, ttl: Duration) -> Self {
        Self {
            inner: LayeredCache::new(remote, ttl, API_KEY_CACHE_CAPACITY),
        }
    }

    fn key(api_key_id: &str) -> String {
        format!("environment_api_key:{api_key_id}")
    }

    pub async fn get(&self, api_key_id: &str) -> Result<Arc<EnvironmentApiKey>, CacheError> {
        self.inner.get(&Self::key(api_key_id)).await
    }

    pub async fn put(&self, api_key_id: &str, key: EnvironmentApiKey) {
        self.inner.put(&Self::key(api_key_id), key).await
    }
}
