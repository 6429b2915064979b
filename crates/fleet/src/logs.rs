//! Pod log retrieval for cluster workers.
//!
//! The backing pod is read from the worker's status, falling back to the
//! kind's deterministic pod name.

use futures::{AsyncBufReadExt, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::cluster::ClusterClient;
use crate::config::LogConfig;
use crate::error::{FleetError, Result};

/// Options for tail and follow requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogOptions {
    pub tail_lines: i64,
    pub timestamps: bool,
    #[serde(default)]
    pub previous: bool,
    #[serde(default)]
    pub since_seconds: Option<i64>,
    #[serde(default)]
    pub container: Option<String>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            tail_lines: 100,
            timestamps: true,
            previous: false,
            since_seconds: None,
            container: None,
        }
    }
}

impl LogOptions {
    #[must_use]
    pub fn from_config(config: &LogConfig) -> Self {
        Self {
            tail_lines: config.tail_lines,
            timestamps: config.timestamps,
            ..Self::default()
        }
    }

    fn params(&self, follow: bool) -> LogParams {
        LogParams {
            container: self.container.clone(),
            follow,
            previous: self.previous,
            since_seconds: self.since_seconds,
            tail_lines: Some(self.tail_lines),
            timestamps: self.timestamps,
            ..LogParams::default()
        }
    }
}

thread_local! {
    static DELIVERING: Cell<bool> = const { Cell::new(false) };
}

/// Serializes chunk delivery with cancellation: the token is checked and the
/// chunk handed over under one lock, which `cancel` also takes.
#[derive(Debug, Default)]
struct DeliveryGate {
    lock: Mutex<()>,
}

impl DeliveryGate {
    /// Run `deliver` unless `token` is cancelled. Returns false when it is.
    fn deliver(&self, token: &CancellationToken, deliver: impl FnOnce()) -> bool {
        let _held = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        if token.is_cancelled() {
            return false;
        }
        let _marker = DeliveringMarker::enter();
        deliver();
        true
    }

    /// Cancel `token` and wait out a chunk already being delivered. Called
    /// from inside that delivery, it only cancels.
    fn close(&self, token: &CancellationToken) {
        token.cancel();
        if !DELIVERING.with(Cell::get) {
            drop(self.lock.lock().unwrap_or_else(PoisonError::into_inner));
        }
    }
}

struct DeliveringMarker;

impl DeliveringMarker {
    fn enter() -> Self {
        DELIVERING.with(|d| d.set(true));
        Self
    }
}

impl Drop for DeliveringMarker {
    fn drop(&mut self) {
        DELIVERING.with(|d| d.set(false));
    }
}

/// Control handle for a following log stream.
///
/// Dropping the handle cancels the stream.
#[derive(Debug)]
pub struct LogStreamHandle {
    token: CancellationToken,
    gate: Arc<DeliveryGate>,
    task: JoinHandle<()>,
}

impl LogStreamHandle {
    /// Stop the stream. No chunk is delivered after this returns; later
    /// calls do nothing.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            debug!("Cancelling log stream");
        }
        self.gate.close(&self.token);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True once the stream has ended, for whatever reason.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the stream to end without cancelling it.
    pub async fn wait(mut self) {
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "Log stream task failed");
        }
    }
}

impl Drop for LogStreamHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

impl ClusterClient {
    /// The most recent `tail_lines` lines of the worker's pod log.
    #[instrument(skip(self, options))]
    pub async fn tail_logs(
        &self,
        name: &str,
        namespace: Option<&str>,
        options: &LogOptions,
    ) -> Result<String> {
        let (pods, pod) = self.resolve_pod(name, namespace).await?;
        pods.logs(&pod, &options.params(false))
            .await
            .map_err(|e| not_found_as_pod(e, name, &pod))
    }

    /// Follow the worker's pod log, handing each line to `on_chunk`.
    ///
    /// Returns once the stream is open; a missing pod fails with
    /// `PodNotFound` before any chunk is delivered.
    pub async fn stream_logs<F>(
        &self,
        name: &str,
        namespace: Option<&str>,
        options: &LogOptions,
        on_chunk: F,
    ) -> Result<LogStreamHandle>
    where
        F: FnMut(String) + Send + 'static,
    {
        self.stream_logs_until(name, namespace, options, CancellationToken::new(), on_chunk)
            .await
    }

    /// [`stream_logs`](Self::stream_logs) stopped by a caller-owned token.
    ///
    /// Cancelling `token` directly stops delivery after the chunk in flight;
    /// [`LogStreamHandle::cancel`] also waits for that chunk.
    #[instrument(skip(self, options, token, on_chunk))]
    pub async fn stream_logs_until<F>(
        &self,
        name: &str,
        namespace: Option<&str>,
        options: &LogOptions,
        token: CancellationToken,
        mut on_chunk: F,
    ) -> Result<LogStreamHandle>
    where
        F: FnMut(String) + Send + 'static,
    {
        let (pods, pod) = self.resolve_pod(name, namespace).await?;
        let params = options.params(true);
        let gate = Arc::new(DeliveryGate::default());
        let (opened_tx, opened_rx) = oneshot::channel();

        let task_token = token.clone();
        let task_gate = Arc::clone(&gate);
        let task_pod = pod.clone();
        let task = tokio::spawn(async move {
            let reader = match pods.log_stream(&task_pod, &params).await {
                Ok(reader) => {
                    let _ = opened_tx.send(Ok(()));
                    reader
                }
                Err(e) => {
                    let _ = opened_tx.send(Err(e));
                    return;
                }
            };

            let lines = reader.lines();
            futures::pin_mut!(lines);
            loop {
                tokio::select! {
                    biased;
                    () = task_token.cancelled() => break,
                    next = lines.next() => match next {
                        Some(Ok(line)) => {
                            let chunk = format!("{line}\n");
                            if !task_gate.deliver(&task_token, || on_chunk(chunk)) {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            warn!(pod = %task_pod, error = %e, "Log stream read failed");
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!(pod = %task_pod, "Log stream ended");
        });

        let handle = LogStreamHandle { token, gate, task };
        match opened_rx.await {
            Ok(Err(e)) => Err(not_found_as_pod(e, name, &pod)),
            // Sender dropped only if the task died; the handle reports it.
            Ok(Ok(())) | Err(_) => {
                info!(pod = %pod, "Following pod log");
                Ok(handle)
            }
        }
    }

    async fn resolve_pod(&self, name: &str, namespace: Option<&str>) -> Result<(Api<Pod>, String)> {
        let client = self.client()?;
        let namespace = self.resolve_namespace(namespace);
        let worker = self.get_worker(name, Some(&namespace)).await?;
        let pod = worker
            .cluster()
            .and_then(|c| c.pod_name.clone())
            .unwrap_or_else(|| self.worker_kind().default_pod_name(name));
        Ok((Api::namespaced(client, &namespace), pod))
    }
}

fn not_found_as_pod(err: kube::Error, worker: &str, pod: &str) -> FleetError {
    match err {
        kube::Error::Api(ref e) if e.code == 404 => FleetError::PodNotFound {
            worker: worker.to_string(),
            pod: pod.to_string(),
        },
        other => FleetError::Transport(other),
    }
}

/// Lines of `text` containing `query`, ignoring case. An empty query keeps
/// everything.
#[must_use]
pub fn filter_lines(text: &str, query: &str) -> String {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return text.to_string();
    }
    text.lines()
        .filter(|line| line.to_lowercase().contains(&query))
        .collect::<Vec<_>>()
        .join("\n")
}
