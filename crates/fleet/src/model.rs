//! Canonical worker and convoy shapes shared by every layer of the crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{FleetError, Result};

static EMPTY_LABELS: BTreeMap<String, String> = BTreeMap::new();

/// Where a worker was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerSource {
    Local,
    Cluster,
}

impl fmt::Display for WorkerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Cluster => write!(f, "cluster"),
        }
    }
}

/// Post-hoc source filter for merged worker lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceFilter {
    #[default]
    All,
    Local,
    Cluster,
}

impl SourceFilter {
    #[must_use]
    pub fn admits(self, source: WorkerSource) -> bool {
        match self {
            Self::All => true,
            Self::Local => source == WorkerSource::Local,
            Self::Cluster => source == WorkerSource::Cluster,
        }
    }
}

/// Lifecycle phase of a cluster-sourced worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum WorkerPhase {
    Queued,
    Claimed,
    Running,
    Succeeded,
    Failed,
    #[default]
    #[serde(other)]
    Unknown,
}

impl WorkerPhase {
    /// Parses a raw phase string; anything unrecognized is `Unknown`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Queued" => Self::Queued,
            "Claimed" => Self::Claimed,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Claimed => "Claimed",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// Phases in which the controller is actively holding the worker.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Claimed)
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status vocabulary of a local (CLI-driven) worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LocalStatus {
    Idle,
    Running,
    Working,
    Complete,
    Error,
}

impl LocalStatus {
    /// Derives the status from the two flags the bridge reports.
    #[must_use]
    pub const fn from_flags(running: bool, has_work: bool) -> Self {
        match (running, has_work) {
            (false, _) => Self::Idle,
            (true, true) => Self::Working,
            (true, false) => Self::Running,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Working => "working",
            Self::Complete => "complete",
            Self::Error => "error",
        }
    }
}

/// The two record shapes a cluster worker may be stored as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WorkerKind {
    #[default]
    Polecat,
    Automaton,
}

impl WorkerKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Polecat => "Polecat",
            Self::Automaton => "Automaton",
        }
    }

    #[must_use]
    pub const fn plural(&self) -> &'static str {
        match self {
            Self::Polecat => "polecats",
            Self::Automaton => "automatons",
        }
    }

    /// Pod name used when the record does not report one.
    #[must_use]
    pub fn default_pod_name(&self, worker: &str) -> String {
        match self {
            Self::Polecat => format!("polecat-{worker}"),
            Self::Automaton => format!("automaton-{worker}"),
        }
    }
}

/// Execution metrics reported by a cluster worker.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerMetrics {
    pub iterations: u64,
    pub tokens_used: u64,
    pub cost_usd: f64,
    pub duration_seconds: f64,
}

/// Numeric metric a ranking can be computed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MetricField {
    Iterations,
    TokensUsed,
    CostUsd,
    DurationSeconds,
}

impl MetricField {
    #[must_use]
    pub fn value(self, metrics: &WorkerMetrics) -> f64 {
        match self {
            Self::Iterations => metrics.iterations as f64,
            Self::TokensUsed => metrics.tokens_used as f64,
            Self::CostUsd => metrics.cost_usd,
            Self::DurationSeconds => metrics.duration_seconds,
        }
    }
}

/// Fields only a cluster worker has.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterWorker {
    pub namespace: String,
    pub kind: WorkerKind,
    pub phase: WorkerPhase,
    pub health_state: String,
    pub forge_ref: Option<String>,
    pub agent_type: Option<String>,
    pub execution_mode: Option<String>,
    pub claimed_by: Option<String>,
    pub pod_name: Option<String>,
    pub limits: Option<Value>,
    pub metrics: Option<WorkerMetrics>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub conditions: Vec<Value>,
}

/// Fields only a local worker has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalWorker {
    pub rig: String,
    pub address: Option<String>,
    pub status: LocalStatus,
    pub running: bool,
    pub has_work: bool,
}

/// Source-specific half of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum WorkerOrigin {
    Local(LocalWorker),
    Cluster(ClusterWorker),
}

/// A unit of work execution, from either source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Worker {
    pub id: String,
    pub name: String,
    pub objective: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub origin: WorkerOrigin,
}

impl Worker {
    #[must_use]
    pub fn source(&self) -> WorkerSource {
        match self.origin {
            WorkerOrigin::Local(_) => WorkerSource::Local,
            WorkerOrigin::Cluster(_) => WorkerSource::Cluster,
        }
    }

    #[must_use]
    pub fn cluster(&self) -> Option<&ClusterWorker> {
        match &self.origin {
            WorkerOrigin::Cluster(c) => Some(c),
            WorkerOrigin::Local(_) => None,
        }
    }

    #[must_use]
    pub fn local(&self) -> Option<&LocalWorker> {
        match &self.origin {
            WorkerOrigin::Local(l) => Some(l),
            WorkerOrigin::Cluster(_) => None,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.cluster().map(|c| c.namespace.as_str())
    }

    #[must_use]
    pub fn rig(&self) -> Option<&str> {
        self.local().map(|l| l.rig.as_str())
    }

    /// Cluster phase; `None` for local workers.
    #[must_use]
    pub fn phase(&self) -> Option<WorkerPhase> {
        self.cluster().map(|c| c.phase)
    }

    /// Labels used for selector matching. Local workers have none.
    #[must_use]
    pub fn labels(&self) -> &BTreeMap<String, String> {
        self.cluster().map_or(&EMPTY_LABELS, |c| &c.labels)
    }

    #[must_use]
    pub fn metrics(&self) -> Option<&WorkerMetrics> {
        self.cluster().and_then(|c| c.metrics.as_ref())
    }

    /// The source-specific state string (`Running`, `idle`, ...).
    #[must_use]
    pub fn state_label(&self) -> &'static str {
        match &self.origin {
            WorkerOrigin::Cluster(c) => c.phase.as_str(),
            WorkerOrigin::Local(l) => l.status.as_str(),
        }
    }
}

/// Label match criteria; every key must match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(rename = "matchLabels", default)]
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    #[must_use]
    pub fn new<K, V>(labels: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConvoyPhase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    #[serde(other)]
    Unknown,
}

impl ConvoyPhase {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "Pending" => Self::Pending,
            "Running" => Self::Running,
            "Succeeded" => Self::Succeeded,
            "Failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvoyMember {
    pub name: String,
    pub phase: WorkerPhase,
}

/// A named, label-selected group of workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Convoy {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub title: Option<String>,
    pub phase: ConvoyPhase,
    pub selector: LabelSelector,
    /// Counts are kept exactly as reported, negative values included.
    pub total: i64,
    pub succeeded: i64,
    pub failed: i64,
    pub running: i64,
    pub members: Vec<ConvoyMember>,
    pub conditions: Vec<Value>,
    pub labels: BTreeMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

impl Convoy {
    /// Members not yet accounted for. Negative when upstream counts disagree.
    #[must_use]
    pub fn pending(&self) -> i64 {
        self.total - self.succeeded - self.failed - self.running
    }

    /// Surfaces a negative count or `pending` as an error instead of
    /// clamping it.
    pub fn check_counts(&self) -> Result<()> {
        let pending = self.pending();
        let counts = [self.total, self.succeeded, self.failed, self.running];
        if pending < 0 || counts.iter().any(|c| *c < 0) {
            return Err(FleetError::InconsistentConvoy {
                id: self.id.clone(),
                pending,
            });
        }
        Ok(())
    }

    /// Rounded share of succeeded members, 0 for an empty convoy.
    #[must_use]
    pub fn progress_percent(&self) -> u64 {
        if self.total <= 0 || self.succeeded <= 0 {
            return 0;
        }
        ((self.succeeded as f64 / self.total as f64) * 100.0).round() as u64
    }
}

/// A Rig/Forge execution environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Forge {
    pub name: String,
    pub namespace: Option<String>,
    #[serde(rename = "gitURL")]
    pub git_url: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionMode {
    InCluster,
    Kubeconfig,
}

/// Connection state of one cluster client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub connected: bool,
    pub mode: Option<ConnectionMode>,
    pub context: Option<String>,
    pub namespace: String,
    pub error: Option<String>,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            connected: false,
            mode: None,
            context: None,
            namespace: "default".to_string(),
            error: None,
            last_check: None,
        }
    }
}

/// A change observed on a watched resource kind.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// The watch failed; no further events follow.
    Error(String),
}

/// Resources addressable by a stable id.
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Worker {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Convoy {
    fn key(&self) -> &str {
        &self.id
    }
}
