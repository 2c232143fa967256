use itom_core::config::{AGENTS_PATH, HEALTH_PATH};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::StoreError;
use crate::store::check;

/// One downstream agent as the backend lists it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// `online`, `offline`, `busy` or `error`; the backend reports
    /// `offline` when the orchestrator is unreachable.
    #[serde(default = "offline")]
    pub status: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub icon: Option<String>,
}

impl AgentInfo {
    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}

fn offline() -> String {
    "offline".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub timestamp: String,
}

/// Read-only client for the backend's agent roster and health check.
pub struct BackendDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl BackendDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    #[instrument(skip(self))]
    pub async fn agents(&self) -> Result<Vec<AgentInfo>, StoreError> {
        let resp = self.client.get(self.url(AGENTS_PATH)).send().await?;
        let resp = check(resp, AGENTS_PATH).await?;
        Ok(resp.json().await?)
    }

    #[instrument(skip(self))]
    pub async fn health(&self) -> Result<HealthReport, StoreError> {
        let resp = self.client.get(self.url(HEALTH_PATH)).send().await?;
        let resp = check(resp, HEALTH_PATH).await?;
        Ok(resp.json().await?)
    }
}
