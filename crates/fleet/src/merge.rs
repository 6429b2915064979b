//! Dual-source worker merge.
//!
//! Cluster and local workers are fetched concurrently. A failing source
//! contributes nothing and is logged; it never fails the merged call.

use async_trait::async_trait;
use serde::Serialize;
use std::cmp::Ordering;
use tracing::{debug, warn};

use crate::bridge::{LocalAgent, LocalAgentSource};
use crate::cluster::ClusterClient;
use crate::error::Result;
use crate::model::{LocalStatus, LocalWorker, SourceFilter, Worker, WorkerOrigin};

/// Source of cluster workers.
#[async_trait]
pub trait ClusterWorkerSource: Send + Sync {
    /// Normalized workers in `namespace`, or the default namespace.
    async fn list_cluster_workers(&self, namespace: Option<String>) -> Result<Vec<Worker>>;
}

#[async_trait]
impl ClusterWorkerSource for ClusterClient {
    async fn list_cluster_workers(&self, namespace: Option<String>) -> Result<Vec<Worker>> {
        self.list_workers(namespace.as_deref()).await
    }
}

/// What one source contributed to a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "state")]
pub enum SourceOutcome {
    Loaded { count: usize },
    Failed { error: String },
}

impl SourceOutcome {
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

/// Merged worker list plus per-source outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CombinedWorkers {
    pub workers: Vec<Worker>,
    pub local: SourceOutcome,
    pub cluster: SourceOutcome,
}

/// Fetch both sources concurrently and merge them, sorted by name.
pub async fn load_combined(
    cluster: &dyn ClusterWorkerSource,
    local: &dyn LocalAgentSource,
    namespace: Option<&str>,
) -> CombinedWorkers {
    let (local_result, cluster_result) = tokio::join!(
        local.list_local_agents(),
        cluster.list_cluster_workers(namespace.map(str::to_string)),
    );

    let mut workers = Vec::new();

    let local = match local_result {
        Ok(agents) => {
            let count = agents.len();
            workers.extend(agents.into_iter().map(normalize_local));
            SourceOutcome::Loaded { count }
        }
        Err(e) => {
            warn!(error = %e, "Failed to load local workers");
            SourceOutcome::Failed {
                error: e.to_string(),
            }
        }
    };

    let cluster = match cluster_result {
        Ok(found) => {
            let count = found.len();
            workers.extend(found);
            SourceOutcome::Loaded { count }
        }
        Err(e) => {
            warn!(error = %e, "Failed to load cluster workers");
            SourceOutcome::Failed {
                error: e.to_string(),
            }
        }
    };

    workers.sort_by(|a, b| compare_names(&a.name, &b.name));
    debug!(total = workers.len(), "Merged worker sources");

    CombinedWorkers {
        workers,
        local,
        cluster,
    }
}

/// Keep only workers from the requested source.
#[must_use]
pub fn filter(workers: Vec<Worker>, source: SourceFilter) -> Vec<Worker> {
    workers
        .into_iter()
        .filter(|w| source.admits(w.source()))
        .collect()
}

/// Canonical shape of a local agent.
#[must_use]
pub fn normalize_local(agent: LocalAgent) -> Worker {
    let address = agent.address.clone().filter(|a| !a.is_empty());
    let segments: Vec<&str> = address.as_deref().unwrap_or_default().split('/').collect();
    let rig = segments.first().copied().unwrap_or_default().to_string();

    let name = agent
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .or_else(|| {
            segments
                .last()
                .filter(|s| !s.is_empty())
                .map(|s| (*s).to_string())
        })
        .unwrap_or_else(|| "unknown".to_string());

    let id = address
        .clone()
        .or_else(|| agent.id.clone().filter(|i| !i.is_empty()))
        .unwrap_or_else(|| format!("local-{name}"));

    let objective = agent
        .hook
        .and_then(|h| h.title)
        .filter(|t| !t.is_empty())
        .or(agent.current_task.filter(|t| !t.is_empty()));

    Worker {
        id,
        name,
        objective,
        created_at: agent.created_at,
        origin: WorkerOrigin::Local(LocalWorker {
            rig,
            address,
            status: LocalStatus::from_flags(agent.running, agent.has_work),
            running: agent.running,
            has_work: agent.has_work,
        }),
    }
}

/// Case-insensitive, with byte order breaking ties so the result is total.
fn compare_names(a: &str, b: &str) -> Ordering {
    a.to_lowercase()
        .cmp(&b.to_lowercase())
        .then_with(|| a.cmp(b))
}
