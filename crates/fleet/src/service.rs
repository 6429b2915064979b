//! Facade over the cluster client, bridge, merger, metrics and caches.
//!
//! This is the API the presentation layer consumes.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::info;

use crate::bridge::{BridgeClient, LocalAgentSource};
use crate::cache::{Snapshot, WatchCache, WatchEnd};
use crate::cluster::{
    ClusterClient, ConnectionHandle, ConvoyRequest, Deleted, EventStream, WorkerRequest,
};
use crate::config::FleetConfig;
use crate::error::Result;
use crate::logs::{LogOptions, LogStreamHandle};
use crate::merge::{self, CombinedWorkers};
use crate::metrics::{self, MetricsSummary};
use crate::model::{ConnectionStatus, Convoy, Keyed, LabelSelector, SourceFilter, Worker};

/// Live view of one resource kind.
///
/// `updates` receives the full collection after every change; `task`
/// resolves with how the underlying watch ended. The feed does not
/// reconnect.
#[derive(Debug)]
pub struct Feed<T> {
    pub updates: broadcast::Receiver<Snapshot<T>>,
    pub task: JoinHandle<WatchEnd>,
}

pub struct FleetService {
    cluster: ClusterClient,
    local: Arc<dyn LocalAgentSource>,
    log_defaults: LogOptions,
}

impl FleetService {
    /// Connect to the cluster and build the bridge client from configuration.
    ///
    /// A failed cluster connection is not an error here; it shows up in
    /// [`ClusterClient::status`] and as `NotInitialized` on later calls.
    pub async fn connect(config: &FleetConfig) -> Result<Self> {
        let cluster = ClusterClient::initialize(&config.cluster, ConnectionHandle::new()).await;
        let bridge = BridgeClient::new(&config.bridge)?;
        info!(bridge = %bridge.base_url(), "Fleet service ready");
        Ok(Self::new(
            cluster,
            Arc::new(bridge),
            LogOptions::from_config(&config.logs),
        ))
    }

    #[must_use]
    pub fn new(
        cluster: ClusterClient,
        local: Arc<dyn LocalAgentSource>,
        log_defaults: LogOptions,
    ) -> Self {
        Self {
            cluster,
            local,
            log_defaults,
        }
    }

    #[must_use]
    pub fn cluster(&self) -> &ClusterClient {
        &self.cluster
    }

    #[must_use]
    pub fn connection_status(&self) -> ConnectionStatus {
        self.cluster.status()
    }

    #[must_use]
    pub fn contexts(&self) -> Vec<String> {
        self.cluster.contexts()
    }

    /// Switch kubeconfig context; feeds opened afterwards use the new cluster.
    pub async fn set_context(&self, context: &str) -> Result<ConnectionStatus> {
        self.cluster.set_context(context).await
    }

    pub fn set_namespace(&self, namespace: &str) -> ConnectionStatus {
        self.cluster.set_namespace(namespace)
    }

    pub async fn list_normalized_workers(&self, namespace: Option<&str>) -> Result<Vec<Worker>> {
        self.cluster.list_workers(namespace).await
    }

    pub async fn list_normalized_convoys(&self, namespace: Option<&str>) -> Result<Vec<Convoy>> {
        self.cluster.list_convoys(namespace).await
    }

    /// Both sources merged, then narrowed to `source`. Never fails.
    pub async fn get_combined_workers(
        &self,
        namespace: Option<&str>,
        source: SourceFilter,
    ) -> CombinedWorkers {
        let mut combined =
            merge::load_combined(&self.cluster, self.local.as_ref(), namespace).await;
        combined.workers = merge::filter(combined.workers, source);
        combined
    }

    /// Aggregate over the cluster workers of a namespace.
    pub async fn get_metrics_summary(&self, namespace: Option<&str>) -> Result<MetricsSummary> {
        let workers = self.cluster.list_workers(namespace).await?;
        Ok(metrics::aggregate(&workers))
    }

    pub async fn preview_convoy_members(
        &self,
        selector: &LabelSelector,
        namespace: Option<&str>,
    ) -> Result<Vec<Worker>> {
        self.cluster.preview_convoy_members(selector, namespace).await
    }

    pub async fn create_worker(&self, request: &WorkerRequest) -> Result<Worker> {
        self.cluster.create_worker(request).await
    }

    pub async fn create_convoy(&self, request: &ConvoyRequest) -> Result<Convoy> {
        self.cluster.create_convoy(request).await
    }

    pub async fn delete_worker(
        &self,
        name: &str,
        namespace: Option<&str>,
        graceful: bool,
    ) -> Result<Deleted> {
        self.cluster.delete_worker(name, namespace, graceful).await
    }

    pub async fn delete_convoy(&self, name: &str, namespace: Option<&str>) -> Result<Deleted> {
        self.cluster.delete_convoy(name, namespace).await
    }

    /// Tail with the configured defaults unless `options` is given.
    pub async fn tail_logs(
        &self,
        name: &str,
        namespace: Option<&str>,
        options: Option<&LogOptions>,
    ) -> Result<String> {
        let options = options.unwrap_or(&self.log_defaults);
        self.cluster.tail_logs(name, namespace, options).await
    }

    pub async fn stream_logs<F>(
        &self,
        name: &str,
        namespace: Option<&str>,
        options: Option<&LogOptions>,
        on_chunk: F,
    ) -> Result<LogStreamHandle>
    where
        F: FnMut(String) + Send + 'static,
    {
        let options = options.unwrap_or(&self.log_defaults);
        self.cluster
            .stream_logs(name, namespace, options, on_chunk)
            .await
    }

    pub async fn worker_feed(&self, namespace: Option<&str>) -> Result<Feed<Worker>> {
        let events = self.cluster.watch_workers(namespace).await?;
        Ok(spawn_feed("workers", events))
    }

    pub async fn convoy_feed(&self, namespace: Option<&str>) -> Result<Feed<Convoy>> {
        let events = self.cluster.watch_convoys(namespace).await?;
        Ok(spawn_feed("convoys", events))
    }
}

fn spawn_feed<T>(kind: &'static str, events: EventStream<T>) -> Feed<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    let mut cache = WatchCache::new(kind);
    let updates = cache.subscribe();
    let task = tokio::spawn(async move { cache.run(events).await });
    Feed { updates, task }
}
