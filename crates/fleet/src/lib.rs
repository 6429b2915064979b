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

//! Gas Town fleet core
//!
//! Reconciles workers from two sources, local CLI-driven polecats reported
//! by the bridge API and Polecat/Automaton custom resources in a cluster,
//! into one normalized model. Also provides convoy selection, watch caches,
//! pod log access and fleet metrics.

pub mod bridge;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod logs;
pub mod merge;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod selector;
pub mod service;

// Re-export commonly used types
pub use bridge::{BridgeClient, LocalAgent, LocalAgentSource};
pub use cache::{WatchCache, WatchEnd};
pub use cluster::{ClusterClient, ConnectionHandle, ConvoyRequest, WorkerRequest};
pub use config::FleetConfig;
pub use error::{FleetError, Result};
pub use logs::{LogOptions, LogStreamHandle};
pub use merge::{ClusterWorkerSource, CombinedWorkers};
pub use metrics::MetricsSummary;
pub use model::{Convoy, LabelSelector, ResourceEvent, SourceFilter, Worker, WorkerPhase};
pub use service::FleetService;
