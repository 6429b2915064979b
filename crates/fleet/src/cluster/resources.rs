//! Custom resource coordinates for the Gas Town CRDs.

use kube::api::ApiResource;

use crate::config::ClusterConfig;
use crate::model::WorkerKind;

/// Group/version/kind triplets for every resource the client touches.
#[derive(Debug, Clone)]
pub struct CrdResources {
    group: String,
    version: String,
    worker_kind: WorkerKind,
}

impl CrdResources {
    #[must_use]
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            group: config.crd_group.clone(),
            version: config.crd_version.clone(),
            worker_kind: config.worker_kind,
        }
    }

    #[must_use]
    pub fn worker_kind(&self) -> WorkerKind {
        self.worker_kind
    }

    fn resource(&self, kind: &str, plural: &str) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: format!("{}/{}", self.group, self.version),
            kind: kind.to_string(),
            plural: plural.to_string(),
        }
    }

    /// Polecats or Automatons, depending on configuration.
    #[must_use]
    pub fn workers(&self) -> ApiResource {
        self.resource(self.worker_kind.as_str(), self.worker_kind.plural())
    }

    #[must_use]
    pub fn convoys(&self) -> ApiResource {
        self.resource("Convoy", "convoys")
    }

    #[must_use]
    pub fn rigs(&self) -> ApiResource {
        self.resource("Rig", "rigs")
    }
}
