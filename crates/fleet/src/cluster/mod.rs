//! Cluster client for the Gas Town custom resources.
//!
//! Single point of contact with the Kubernetes control plane: worker and
//! convoy CRUD, watches, forge lookups and namespace/context management.
//! Connection state lives in an injected [`ConnectionHandle`] so several
//! clients (one per context) can coexist. Clones of a client share one
//! session: switching context on any clone retargets all of them.

pub mod resources;
pub mod watch;

use chrono::Utc;
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams, WatchParams,
};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

use crate::config::ClusterConfig;
use crate::error::{FleetError, Result};
use crate::model::{
    ConnectionMode, ConnectionStatus, Convoy, Forge, LabelSelector, Worker, WorkerKind,
};
use crate::normalize::{normalize_convoy, normalize_forge, normalize_worker};
use crate::selector;

pub use resources::CrdResources;
pub use watch::EventStream;

/// Present in every pod the kubelet starts.
const ENV_IN_CLUSTER: &str = "KUBERNETES_SERVICE_HOST";

/// Fixed wait after asking a running worker to terminate.
pub const GRACE_PERIOD: Duration = Duration::from_secs(1);

/// Shared, lock-protected connection status.
///
/// Only [`ClusterClient`] writes through it; everyone else reads copies.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHandle(Arc<RwLock<ConnectionStatus>>);

impl ConnectionHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the current status.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionStatus {
        self.0
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut ConnectionStatus)) {
        let mut status = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut status);
        status.last_check = Some(Utc::now());
    }
}

/// Model selection for a new worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdkConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "modelConfig")]
    pub model_config: ModelConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model: String,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            kind: "claude".to_string(),
            model_config: ModelConfig {
                model: "claude-sonnet-4".to_string(),
            },
        }
    }
}

/// Execution limits for a new worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionLimits {
    pub max_duration: String,
    pub max_iterations: u32,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_duration: "1h".to_string(),
            max_iterations: 50,
        }
    }
}

/// Request to create a worker resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerRequest {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    pub objective: String,
    #[serde(default)]
    pub sdk: Option<SdkConfig>,
    #[serde(default)]
    pub limits: Option<ExecutionLimits>,
    #[serde(default)]
    pub forge_ref: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Request to create a convoy resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvoyRequest {
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub selector: LabelSelector,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Hand a local bead to the cluster as a new worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeadSling {
    pub bead_id: String,
    #[serde(default)]
    pub bead_title: Option<String>,
    #[serde(default)]
    pub bead_description: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub forge_ref: Option<String>,
    #[serde(default)]
    pub sdk: Option<SdkConfig>,
}

/// Acknowledgement of a delete call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deleted {
    pub name: String,
    pub namespace: String,
}

struct Connection {
    client: Client,
    kubeconfig: Option<Kubeconfig>,
    mode: ConnectionMode,
    context: String,
}

/// The live API client and the kubeconfig it was built from.
#[derive(Default)]
struct Session {
    client: Option<Client>,
    kubeconfig: Option<Kubeconfig>,
}

/// Kubernetes client for workers, convoys and forges.
#[derive(Clone)]
pub struct ClusterClient {
    session: Arc<RwLock<Session>>,
    resources: CrdResources,
    status: ConnectionHandle,
}

impl ClusterClient {
    /// Connect using in-cluster credentials when running in a pod, otherwise
    /// the configured kubeconfig file, otherwise default discovery.
    ///
    /// Never fails: on error the status records `connected = false` and the
    /// message, and every later call returns `NotInitialized`.
    pub async fn initialize(config: &ClusterConfig, status: ConnectionHandle) -> Self {
        let in_cluster = std::env::var_os(ENV_IN_CLUSTER).is_some();

        let attempt = if in_cluster {
            connect_in_cluster()
        } else {
            connect_kubeconfig(config.kubeconfig_path.as_deref(), config.context.clone()).await
        };

        let resources = CrdResources::from_config(config);
        match attempt {
            Ok(conn) => {
                info!(mode = ?conn.mode, context = %conn.context, "Kubernetes client initialized");
                status.update(|s| {
                    s.connected = true;
                    s.error = None;
                    s.mode = Some(conn.mode);
                    s.context = Some(conn.context.clone());
                    s.namespace.clone_from(&config.namespace);
                });
                Self {
                    session: Arc::new(RwLock::new(Session {
                        client: Some(conn.client),
                        kubeconfig: conn.kubeconfig,
                    })),
                    resources,
                    status,
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to initialize Kubernetes client");
                status.update(|s| {
                    s.connected = false;
                    s.error = Some(e.to_string());
                    s.namespace.clone_from(&config.namespace);
                });
                Self {
                    session: Arc::default(),
                    resources,
                    status,
                }
            }
        }
    }

    #[must_use]
    pub fn status(&self) -> ConnectionStatus {
        self.status.snapshot()
    }

    #[must_use]
    pub fn connection(&self) -> ConnectionHandle {
        self.status.clone()
    }

    #[must_use]
    pub fn resources(&self) -> &CrdResources {
        &self.resources
    }

    #[must_use]
    pub fn default_namespace(&self) -> String {
        self.status.snapshot().namespace
    }

    pub fn set_namespace(&self, namespace: &str) -> ConnectionStatus {
        self.status.update(|s| s.namespace = namespace.to_string());
        self.status()
    }

    /// Context names from the loaded kubeconfig; empty in-cluster.
    #[must_use]
    pub fn contexts(&self) -> Vec<String> {
        self.read_session()
            .kubeconfig
            .as_ref()
            .map(|kc| kc.contexts.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Rebuild the client for another kubeconfig context. Every clone of
    /// this client targets the new context afterwards.
    pub async fn set_context(&self, context: &str) -> Result<ConnectionStatus> {
        let kubeconfig = self
            .read_session()
            .kubeconfig
            .clone()
            .ok_or(FleetError::NotInitialized)?;
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..KubeConfigOptions::default()
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|e| FleetError::Kubeconfig(e.to_string()))?;
        let client = Client::try_from(config)?;

        {
            // Status is written under the session lock so readers never see
            // the new context paired with the old client.
            let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
            session.client = Some(client);
            self.status.update(|s| s.context = Some(context.to_string()));
        }
        info!(context = %context, "Switched Kubernetes context");
        Ok(self.status())
    }

    /// Probe the API server by listing a single namespace.
    pub async fn test_connection(&self) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client()?);
        match namespaces.list(&ListParams::default().limit(1)).await {
            Ok(_) => {
                self.status.update(|s| {
                    s.connected = true;
                    s.error = None;
                });
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Kubernetes connectivity test failed");
                self.status.update(|s| {
                    s.connected = false;
                    s.error = Some(e.to_string());
                });
                Err(e.into())
            }
        }
    }

    pub async fn list_namespaces(&self) -> Result<Vec<String>> {
        let namespaces: Api<Namespace> = Api::all(self.client()?);
        let list = namespaces.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|ns| ns.metadata.name)
            .collect())
    }

    #[instrument(skip(self))]
    pub async fn list_workers(&self, namespace: Option<&str>) -> Result<Vec<Worker>> {
        let api = self.workers_api(namespace)?;
        let list = api.list(&ListParams::default()).await?;
        debug!(count = list.items.len(), "Listed workers");
        Ok(list.items.iter().map(normalize_worker).collect())
    }

    #[instrument(skip(self))]
    pub async fn get_worker(&self, name: &str, namespace: Option<&str>) -> Result<Worker> {
        let api = self.workers_api(namespace)?;
        Ok(normalize_worker(&api.get(name).await?))
    }

    #[instrument(skip(self))]
    pub async fn list_convoys(&self, namespace: Option<&str>) -> Result<Vec<Convoy>> {
        let api = self.convoys_api(namespace)?;
        let list = api.list(&ListParams::default()).await?;
        debug!(count = list.items.len(), "Listed convoys");
        Ok(list.items.iter().map(normalize_convoy).collect())
    }

    #[instrument(skip(self))]
    pub async fn get_convoy(&self, name: &str, namespace: Option<&str>) -> Result<Convoy> {
        let api = self.convoys_api(namespace)?;
        Ok(normalize_convoy(&api.get(name).await?))
    }

    /// Create a worker, filling in default SDK and limits when absent.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_worker(&self, request: &WorkerRequest) -> Result<Worker> {
        if request.name.trim().is_empty() {
            return Err(FleetError::InvalidRequest { field: "name" });
        }
        if request.objective.trim().is_empty() {
            return Err(FleetError::InvalidRequest { field: "objective" });
        }

        let namespace = self.resolve_namespace(request.namespace.as_deref());
        let api = self.workers_api(Some(&namespace))?;

        let mut spec = Map::new();
        spec.insert("objective".to_string(), json!(request.objective));
        spec.insert(
            "sdk".to_string(),
            json!(request.sdk.clone().unwrap_or_default()),
        );
        spec.insert(
            "limits".to_string(),
            json!(request.limits.clone().unwrap_or_default()),
        );
        if let Some(forge) = &request.forge_ref {
            spec.insert("forgeRef".to_string(), json!(forge));
        }

        let mut obj = DynamicObject::new(&request.name, &self.resources.workers())
            .within(&namespace)
            .data(json!({ "spec": Value::Object(spec) }));
        obj.metadata.labels = Some(request.labels.clone());

        let created = api.create(&PostParams::default(), &obj).await?;
        info!(namespace = %namespace, "Created worker");
        Ok(normalize_worker(&created))
    }

    /// Delete a worker. With `graceful`, a Running or Claimed worker is first
    /// asked to terminate; failures of that step are logged and ignored.
    #[instrument(skip(self))]
    pub async fn delete_worker(
        &self,
        name: &str,
        namespace: Option<&str>,
        graceful: bool,
    ) -> Result<Deleted> {
        let namespace = self.resolve_namespace(namespace);
        let api = self.workers_api(Some(&namespace))?;

        if graceful {
            if let Err(e) = request_termination(&api, name).await {
                warn!(error = %e, "Graceful shutdown patch failed, deleting anyway");
            }
        }

        api.delete(name, &DeleteParams::default()).await?;
        info!(namespace = %namespace, "Deleted worker");
        Ok(Deleted {
            name: name.to_string(),
            namespace,
        })
    }

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_convoy(&self, request: &ConvoyRequest) -> Result<Convoy> {
        if request.name.trim().is_empty() {
            return Err(FleetError::InvalidRequest { field: "name" });
        }

        let namespace = self.resolve_namespace(request.namespace.as_deref());
        let api = self.convoys_api(Some(&namespace))?;

        let mut obj = DynamicObject::new(&request.name, &self.resources.convoys())
            .within(&namespace)
            .data(json!({
                "spec": {
                    "title": request.title,
                    "selector": request.selector,
                }
            }));
        obj.metadata.labels = Some(request.labels.clone());

        let created = api.create(&PostParams::default(), &obj).await?;
        info!(namespace = %namespace, "Created convoy");
        Ok(normalize_convoy(&created))
    }

    #[instrument(skip(self))]
    pub async fn delete_convoy(&self, name: &str, namespace: Option<&str>) -> Result<Deleted> {
        let namespace = self.resolve_namespace(namespace);
        let api = self.convoys_api(Some(&namespace))?;
        api.delete(name, &DeleteParams::default()).await?;
        info!(namespace = %namespace, "Deleted convoy");
        Ok(Deleted {
            name: name.to_string(),
            namespace,
        })
    }

    /// Workers in the namespace whose labels satisfy the selector.
    pub async fn preview_convoy_members(
        &self,
        selector: &LabelSelector,
        namespace: Option<&str>,
    ) -> Result<Vec<Worker>> {
        let workers = self.list_workers(namespace).await?;
        Ok(selector::select(workers, selector))
    }

    /// Create a worker from a local bead.
    pub async fn sling_bead(&self, sling: &BeadSling) -> Result<Worker> {
        if sling.bead_id.trim().is_empty() {
            return Err(FleetError::InvalidRequest { field: "beadId" });
        }
        let objective = sling
            .bead_description
            .clone()
            .filter(|d| !d.trim().is_empty())
            .or_else(|| sling.bead_title.clone())
            .unwrap_or_default();

        let mut labels = BTreeMap::new();
        labels.insert("gastown.io/source".to_string(), "local-bead".to_string());
        labels.insert("gastown.io/bead-id".to_string(), sling.bead_id.clone());

        self.create_worker(&WorkerRequest {
            name: bead_worker_name(&sling.bead_id),
            namespace: sling.namespace.clone(),
            objective,
            sdk: sling.sdk.clone(),
            limits: None,
            forge_ref: sling.forge_ref.clone(),
            labels,
        })
        .await
    }

    /// Open a watch on workers in the namespace.
    pub async fn watch_workers(&self, namespace: Option<&str>) -> Result<EventStream<Worker>> {
        let api = self.workers_api(namespace)?;
        let events = api.watch(&WatchParams::default(), "0").await?;
        Ok(watch::normalized_events(events, normalize_worker))
    }

    /// Open a watch on convoys in the namespace.
    pub async fn watch_convoys(&self, namespace: Option<&str>) -> Result<EventStream<Convoy>> {
        let api = self.convoys_api(namespace)?;
        let events = api.watch(&WatchParams::default(), "0").await?;
        Ok(watch::normalized_events(events, normalize_convoy))
    }

    /// Rigs/Forges, namespaced first and cluster-scoped as a fallback. Both
    /// lookups failing yields an empty list.
    #[instrument(skip(self))]
    pub async fn list_forges(&self, namespace: Option<&str>) -> Result<Vec<Forge>> {
        let client = self.client()?;
        let namespace = self.resolve_namespace(namespace);
        let rigs = self.resources.rigs();

        let namespaced: Api<DynamicObject> = Api::namespaced_with(client.clone(), &namespace, &rigs);
        match namespaced.list(&ListParams::default()).await {
            Ok(list) => return Ok(list.items.iter().map(|o| normalize_forge(o, false)).collect()),
            Err(e) => debug!(error = %e, "Namespaced rig lookup failed, trying cluster scope"),
        }

        let cluster: Api<DynamicObject> = Api::all_with(client, &rigs);
        match cluster.list(&ListParams::default()).await {
            Ok(list) => Ok(list.items.iter().map(|o| normalize_forge(o, true)).collect()),
            Err(e) => {
                warn!(error = %e, "Could not list rigs");
                Ok(Vec::new())
            }
        }
    }

    /// The current API client; cheap to clone.
    pub(crate) fn client(&self) -> Result<Client> {
        self.read_session()
            .client
            .clone()
            .ok_or(FleetError::NotInitialized)
    }

    fn read_session(&self) -> RwLockReadGuard<'_, Session> {
        self.session.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn resolve_namespace(&self, namespace: Option<&str>) -> String {
        namespace.map_or_else(|| self.default_namespace(), str::to_string)
    }

    fn workers_api(&self, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let client = self.client()?;
        let ns = self.resolve_namespace(namespace);
        Ok(Api::namespaced_with(client, &ns, &self.resources.workers()))
    }

    fn convoys_api(&self, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let client = self.client()?;
        let ns = self.resolve_namespace(namespace);
        Ok(Api::namespaced_with(client, &ns, &self.resources.convoys()))
    }

    pub(crate) fn worker_kind(&self) -> WorkerKind {
        self.resources.worker_kind()
    }
}

/// Patch an active worker's desired state to Terminated and give the
/// controller a moment to act on it.
async fn request_termination(api: &Api<DynamicObject>, name: &str) -> Result<()> {
    let current = normalize_worker(&api.get(name).await?);
    let active = current.phase().is_some_and(|p| p.is_active());
    if !active {
        debug!(worker = %name, "Worker not active, skipping graceful shutdown");
        return Ok(());
    }

    let patch = json!({ "spec": { "desiredState": "Terminated" } });
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!(worker = %name, "Requested termination, waiting for controller");
    tokio::time::sleep(GRACE_PERIOD).await;
    Ok(())
}

fn connect_in_cluster() -> Result<Connection> {
    let config = Config::incluster().map_err(|e| FleetError::Kubeconfig(e.to_string()))?;
    Ok(Connection {
        client: Client::try_from(config)?,
        kubeconfig: None,
        mode: ConnectionMode::InCluster,
        context: "in-cluster".to_string(),
    })
}

async fn connect_kubeconfig(path: Option<&Path>, context: Option<String>) -> Result<Connection> {
    let kubeconfig = match path {
        Some(path) => Kubeconfig::read_from(path),
        None => Kubeconfig::read(),
    }
    .map_err(|e| FleetError::Kubeconfig(e.to_string()))?;

    let context = context.or_else(|| kubeconfig.current_context.clone());
    let options = KubeConfigOptions {
        context: context.clone(),
        ..KubeConfigOptions::default()
    };
    let config = Config::from_custom_kubeconfig(kubeconfig.clone(), &options)
        .await
        .map_err(|e| FleetError::Kubeconfig(e.to_string()))?;

    Ok(Connection {
        client: Client::try_from(config)?,
        kubeconfig: Some(kubeconfig),
        mode: ConnectionMode::Kubeconfig,
        context: context.unwrap_or_default(),
    })
}

/// `bead-` plus the bead id, lowercased, with anything outside `[a-z0-9-]`
/// replaced by `-`.
#[must_use]
pub fn bead_worker_name(bead_id: &str) -> String {
    let slug: String = bead_id
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("bead-{slug}")
}
