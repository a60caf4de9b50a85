//! CRUD backend client — the authoritative task source, consumed read-only.
//!
//! The local cache is eventually consistent with this backend, never the
//! other way around. The only operation this crate needs is the full fetch
//! used to rebuild the cache after an extended disconnection.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::auth::{AuthError, TokenProvider};
use crate::events::Task;
use crate::retry::{retry_with_backoff, RetryConfig};

const REQUEST_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned status {0}")]
    Status(u16),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// Authoritative task source.
#[async_trait]
pub trait TaskBackend: Send + Sync {
    /// Fetch every task. The refresh-after-offline recovery path.
    async fn list_tasks(&self) -> Result<Vec<Task>, BackendError>;
}

/// HTTP implementation against the TaskDeck REST API.
pub struct HttpTaskBackend {
    client: reqwest::Client,
    base_url: String,
    token: Arc<dyn TokenProvider>,
    retry: RetryConfig,
}

impl HttpTaskBackend {
    pub fn new(
        base_url: impl Into<String>,
        token: Arc<dyn TokenProvider>,
        retry: RetryConfig,
    ) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            retry,
        })
    }
}

#[async_trait]
impl TaskBackend for HttpTaskBackend {
    async fn list_tasks(&self) -> Result<Vec<Task>, BackendError> {
        let token = self.token.bearer_token().await?;
        let url = format!("{}/api/tasks", self.base_url);
        let (client, url, token) = (&self.client, url.as_str(), token.as_str());
        retry_with_backoff(&self.retry, || async move {
            let resp = client
                .get(url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(BackendError::Http)?;
            if !resp.status().is_success() {
                return Err(BackendError::Status(resp.status().as_u16()));
            }
            Ok(resp.json::<Vec<Task>>().await?)
        })
        .await
    }
}
