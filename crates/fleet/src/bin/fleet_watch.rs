/*
 * 5D Labs Agent Platform - Gas Town Fleet Core
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Fleet Watcher - keeps worker and convoy caches in sync with the cluster
//!
//! Watches terminate on any transport error and are never retried by the
//! library. This binary is the supervisor that re-establishes them:
//! - Resync each kind with a full list
//! - Drain the watch into the cache until it ends
//! - Wait `reconnectDelaySecs`, then start over

use anyhow::{bail, Context};
use async_trait::async_trait;
use fleet::cache::{WatchCache, WatchEnd};
use fleet::cluster::{ClusterClient, ConnectionHandle, EventStream};
use fleet::metrics;
use fleet::model::{Convoy, Keyed, Worker, WorkerPhase};
use fleet::FleetConfig;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const ENV_LOG_FORMAT: &str = "FLEET_LOG_FORMAT";

/// A resource kind the supervisor keeps cached.
#[async_trait]
trait Supervised: Keyed + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    async fn list(client: &ClusterClient, namespace: &str) -> fleet::Result<Vec<Self>>;

    async fn watch(client: &ClusterClient, namespace: &str) -> fleet::Result<EventStream<Self>>;

    fn report(snapshot: &[Self]);
}

#[async_trait]
impl Supervised for Worker {
    const KIND: &'static str = "workers";

    async fn list(client: &ClusterClient, namespace: &str) -> fleet::Result<Vec<Self>> {
        client.list_workers(Some(namespace)).await
    }

    async fn watch(client: &ClusterClient, namespace: &str) -> fleet::Result<EventStream<Self>> {
        client.watch_workers(Some(namespace)).await
    }

    fn report(snapshot: &[Self]) {
        let summary = metrics::aggregate(snapshot);
        info!(
            total = summary.total,
            running = summary.count(WorkerPhase::Running.as_str()),
            completed = summary.completed,
            success_rate = metrics::success_rate(&summary),
            tokens_used = summary.totals.tokens_used,
            cost_usd = summary.totals.cost_usd,
            "Worker fleet updated"
        );
    }
}

#[async_trait]
impl Supervised for Convoy {
    const KIND: &'static str = "convoys";

    async fn list(client: &ClusterClient, namespace: &str) -> fleet::Result<Vec<Self>> {
        client.list_convoys(Some(namespace)).await
    }

    async fn watch(client: &ClusterClient, namespace: &str) -> fleet::Result<EventStream<Self>> {
        client.watch_convoys(Some(namespace)).await
    }

    fn report(snapshot: &[Self]) {
        for convoy in snapshot {
            if let Err(e) = convoy.check_counts() {
                warn!(convoy = %convoy.id, error = %e, "Inconsistent convoy");
            }
        }
        info!(total = snapshot.len(), "Convoys updated");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!(
        "Starting Gas Town fleet watcher v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = FleetConfig::load().context("failed to load fleet configuration")?;
    let client = ClusterClient::initialize(&config.cluster, ConnectionHandle::new()).await;

    let status = client.status();
    if !status.connected {
        bail!(
            "could not connect to Kubernetes: {}",
            status.error.unwrap_or_default()
        );
    }
    info!(
        namespace = %status.namespace,
        context = status.context.as_deref().unwrap_or("none"),
        "Connected to Kubernetes cluster"
    );

    let delay = config.watch.reconnect_delay();
    let namespace = config.cluster.namespace.clone();

    let workers = tokio::spawn(supervise::<Worker>(client.clone(), namespace.clone(), delay));
    let convoys = tokio::spawn(supervise::<Convoy>(client, namespace, delay));

    shutdown_signal().await;

    workers.abort();
    convoys.abort();
    info!("Fleet watcher stopped");

    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,fleet=debug".into());

    if std::env::var(ENV_LOG_FORMAT).is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Resync, watch, drain, wait, repeat. Runs until aborted.
async fn supervise<T: Supervised>(client: ClusterClient, namespace: String, delay: Duration) {
    let mut cache = WatchCache::<T>::new(T::KIND);
    let mut updates = cache.subscribe();

    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(snapshot) => T::report(&snapshot),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(kind = T::KIND, skipped, "Reporter lagged behind cache");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    loop {
        match T::list(&client, &namespace).await {
            Ok(items) => {
                cache.reset(items);
                match T::watch(&client, &namespace).await {
                    Ok(events) => match cache.run(events).await {
                        WatchEnd::Closed => info!(kind = T::KIND, "Watch closed"),
                        WatchEnd::Failed(reason) => {
                            warn!(kind = T::KIND, error = %reason, "Watch failed");
                        }
                    },
                    Err(e) => warn!(kind = T::KIND, error = %e, "Could not open watch"),
                }
            }
            Err(e) => warn!(kind = T::KIND, error = %e, "Resync list failed"),
        }

        debug!(kind = T::KIND, delay_secs = delay.as_secs(), "Reconnecting after delay");
        tokio::time::sleep(delay).await;
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        () = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
