//! HTTP client for a warden server's run API, so a bridge can observe runs
//! owned by another process.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use std::time::Duration;
use warden_common::{ProgressSource, QueryError, RunDescription, RunSnapshot, StatusSource};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RemoteRunSource {
    client: reqwest::Client,
    base_url: String,
}

impl RemoteRunSource {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn get_json<T: DeserializeOwned>(&self, run_id: &str, resource: &str) -> Result<T, QueryError> {
        let url = format!("{}/api/runs/{}/{}", self.base_url, run_id, resource);
        let resp = self.client.get(&url).send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                QueryError::Unreachable(e.to_string())
            } else {
                QueryError::Transient(e.to_string())
            }
        })?;

        match resp.status() {
            StatusCode::NOT_FOUND => return Err(QueryError::NotFound(run_id.to_string())),
            StatusCode::TOO_EARLY => return Err(QueryError::NotReady(run_id.to_string())),
            status if !status.is_success() => {
                return Err(QueryError::Transient(format!("HTTP {} from {}", status, url)));
            }
            _ => {}
        }

        resp.json::<T>()
            .await
            .map_err(|e| QueryError::Transient(format!("invalid {} response: {}", resource, e)))
    }
}

#[async_trait]
impl ProgressSource for RemoteRunSource {
    async fn get_progress(&self, run_id: &str) -> Result<RunSnapshot, QueryError> {
        self.get_json(run_id, "progress").await
    }
}

#[async_trait]
impl StatusSource for RemoteRunSource {
    async fn describe(&self, run_id: &str) -> Result<RunDescription, QueryError> {
        self.get_json(run_id, "status").await
    }
}
