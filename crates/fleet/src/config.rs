//! Fleet configuration.
//!
//! Loaded from a YAML file (path in `FLEET_CONFIG`) and then overridden by
//! environment variables. Every field has a default so an empty file, or no
//! file at all, yields a usable configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{FleetError, Result};
use crate::model::WorkerKind;

const ENV_CONFIG_PATH: &str = "FLEET_CONFIG";
const ENV_NAMESPACE: &str = "FLEET_NAMESPACE";
const ENV_CONTEXT: &str = "FLEET_KUBE_CONTEXT";
const ENV_BRIDGE_URL: &str = "FLEET_BRIDGE_URL";

fn default_namespace() -> String {
    "default".to_string()
}

fn default_crd_group() -> String {
    "gastown.gastown.io".to_string()
}

fn default_crd_version() -> String {
    "v1alpha1".to_string()
}

fn default_bridge_url() -> String {
    "http://localhost:7667".to_string()
}

fn default_bridge_timeout() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_tail_lines() -> i64 {
    100
}

fn default_timestamps() -> bool {
    true
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub bridge: BridgeConfig,

    #[serde(default)]
    pub watch: WatchConfig,

    #[serde(default)]
    pub logs: LogConfig,
}

/// Cluster connection and custom resource coordinates
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    /// Default namespace for namespaced operations
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Explicit kubeconfig file, used when not running in-cluster. When
    /// absent, default discovery applies (`KUBECONFIG`, which may list
    /// several files, then `~/.kube/config`).
    #[serde(default)]
    pub kubeconfig_path: Option<PathBuf>,

    /// Kubeconfig context to select (current context when absent)
    #[serde(default)]
    pub context: Option<String>,

    #[serde(default = "default_crd_group")]
    pub crd_group: String,

    #[serde(default = "default_crd_version")]
    pub crd_version: String,

    /// Which worker record kind the cluster serves
    #[serde(default)]
    pub worker_kind: WorkerKind,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            kubeconfig_path: None,
            context: None,
            crd_group: default_crd_group(),
            crd_version: default_crd_version(),
            worker_kind: WorkerKind::default(),
        }
    }
}

/// Bridge API serving the local worker list
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default = "default_bridge_url")]
    pub base_url: String,

    #[serde(default = "default_bridge_timeout")]
    pub timeout_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            base_url: default_bridge_url(),
            timeout_secs: default_bridge_timeout(),
        }
    }
}

impl BridgeConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Watch supervision
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfig {
    /// Pause before re-establishing a terminated watch
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

impl WatchConfig {
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Log retrieval defaults
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    #[serde(default = "default_tail_lines")]
    pub tail_lines: i64,

    #[serde(default = "default_timestamps")]
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            tail_lines: default_tail_lines(),
            timestamps: default_timestamps(),
        }
    }
}

impl FleetConfig {
    /// Read configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FleetError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        serde_yaml::from_str(&content)
            .map_err(|e| FleetError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    /// Load from `FLEET_CONFIG` (defaults when unset), apply environment
    /// overrides and validate.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var(ENV_CONFIG_PATH) {
            Ok(path) => {
                debug!(path = %path, "Loading fleet configuration");
                Self::from_file(Path::new(&path))?
            }
            Err(_) => {
                debug!("FLEET_CONFIG not set, using default configuration");
                Self::default()
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables win over file values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(ns) = non_empty_env(ENV_NAMESPACE) {
            self.cluster.namespace = ns;
        }
        if let Some(ctx) = non_empty_env(ENV_CONTEXT) {
            self.cluster.context = Some(ctx);
        }
        if let Some(url) = non_empty_env(ENV_BRIDGE_URL) {
            self.bridge.base_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("cluster.namespace", self.cluster.namespace.as_str()),
            ("cluster.crdGroup", self.cluster.crd_group.as_str()),
            ("cluster.crdVersion", self.cluster.crd_version.as_str()),
            ("bridge.baseUrl", self.bridge.base_url.as_str()),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(FleetError::Config(format!("{field} must not be empty")));
            }
        }
        if self.logs.tail_lines <= 0 {
            return Err(FleetError::Config(
                "logs.tailLines must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
