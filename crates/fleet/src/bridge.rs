//! Bridge API client for the local (CLI-driven) worker list.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::BridgeConfig;
use crate::error::{FleetError, Result};

/// Path of the agent listing on the bridge.
const AGENTS_PATH: &str = "/api/agents";

/// An agent as reported by the bridge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalAgent {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    /// `rig/polecats/name`
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub has_work: bool,
    #[serde(default)]
    pub current_task: Option<String>,
    #[serde(default)]
    pub hook: Option<Hook>,
    #[serde(default, rename = "createdAt")]
    pub created_at: Option<DateTime<Utc>>,
}

/// Work currently hooked to an agent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hook {
    #[serde(default)]
    pub title: Option<String>,
}

impl LocalAgent {
    /// Polecats are identified by role, or by a `polecats/` address segment.
    #[must_use]
    pub fn is_polecat(&self) -> bool {
        self.role.as_deref() == Some("polecat")
            || self
                .address
                .as_deref()
                .is_some_and(|a| a.contains("polecats/"))
    }
}

/// Source of local workers.
#[async_trait]
pub trait LocalAgentSource: Send + Sync {
    /// Local polecats; other agent roles are excluded.
    async fn list_local_agents(&self) -> Result<Vec<LocalAgent>>;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum AgentsResponse {
    Bare(Vec<LocalAgent>),
    Wrapped {
        #[serde(default)]
        agents: Vec<LocalAgent>,
    },
}

impl AgentsResponse {
    fn into_agents(self) -> Vec<LocalAgent> {
        match self {
            Self::Bare(agents) | Self::Wrapped { agents } => agents,
        }
    }
}

/// HTTP client for the bridge API.
#[derive(Debug, Clone)]
pub struct BridgeClient {
    base_url: String,
    client: reqwest::Client,
}

impl BridgeClient {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl LocalAgentSource for BridgeClient {
    async fn list_local_agents(&self) -> Result<Vec<LocalAgent>> {
        let url = format!("{}{AGENTS_PATH}", self.base_url);
        debug!(url = %url, "Fetching local agents");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Bridge agent listing failed");
            return Err(FleetError::BridgeStatus {
                status: status.as_u16(),
                body,
            });
        }

        let agents: Vec<LocalAgent> = response
            .json::<AgentsResponse>()
            .await?
            .into_agents()
            .into_iter()
            .filter(LocalAgent::is_polecat)
            .collect();
        debug!(count = agents.len(), "Fetched local polecats");
        Ok(agents)
    }
}
