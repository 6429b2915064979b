//! Shared fixtures: a mock Kubernetes API server and a client pointed at it.

#![allow(dead_code)]

use fleet::cluster::{ClusterClient, ConnectionHandle};
use fleet::config::ClusterConfig;
use serde_json::{json, Value};
use std::io::Write;
use tempfile::NamedTempFile;
use wiremock::MockServer;

pub const NAMESPACE: &str = "town";
pub const WORKERS_PATH: &str = "/apis/gastown.gastown.io/v1alpha1/namespaces/town/polecats";
pub const CONVOYS_PATH: &str = "/apis/gastown.gastown.io/v1alpha1/namespaces/town/convoys";

/// A running mock API server and a client connected to it.
///
/// The kubeconfig file must outlive the test, so it is kept here.
pub struct MockCluster {
    pub server: MockServer,
    pub client: ClusterClient,
    _kubeconfig: NamedTempFile,
}

pub fn write_kubeconfig(server_uri: &str) -> NamedTempFile {
    write_kubeconfig_with_other(server_uri, server_uri)
}

/// Context `mock` targets `server_uri`, context `other` targets `other_uri`.
pub fn write_kubeconfig_with_other(server_uri: &str, other_uri: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r"apiVersion: v1
kind: Config
clusters:
- name: mock
  cluster:
    server: {server_uri}
- name: other
  cluster:
    server: {other_uri}
contexts:
- name: mock
  context:
    cluster: mock
    user: tester
    namespace: {NAMESPACE}
- name: other
  context:
    cluster: other
    user: tester
    namespace: {NAMESPACE}
current-context: mock
users:
- name: tester
  user:
    token: test-token
"
    )
    .unwrap();
    file
}

pub async fn mock_cluster() -> MockCluster {
    let server = MockServer::start().await;
    let kubeconfig = write_kubeconfig(&server.uri());
    connect(server, kubeconfig).await
}

/// A mock cluster whose `other` context points at a second server.
pub async fn mock_cluster_with_other() -> (MockCluster, MockServer) {
    let server = MockServer::start().await;
    let other = MockServer::start().await;
    let kubeconfig = write_kubeconfig_with_other(&server.uri(), &other.uri());
    (connect(server, kubeconfig).await, other)
}

async fn connect(server: MockServer, kubeconfig: NamedTempFile) -> MockCluster {
    std::env::remove_var("KUBERNETES_SERVICE_HOST");

    let config = ClusterConfig {
        namespace: NAMESPACE.to_string(),
        kubeconfig_path: Some(kubeconfig.path().to_path_buf()),
        ..ClusterConfig::default()
    };
    let client = ClusterClient::initialize(&config, ConnectionHandle::new()).await;
    MockCluster {
        server,
        client,
        _kubeconfig: kubeconfig,
    }
}

pub fn polecat(name: &str, phase: Option<&str>, labels: Value) -> Value {
    let mut status = json!({});
    if let Some(phase) = phase {
        status["phase"] = json!(phase);
    }
    json!({
        "apiVersion": "gastown.gastown.io/v1alpha1",
        "kind": "Polecat",
        "metadata": {
            "name": name,
            "namespace": NAMESPACE,
            "labels": labels,
            "resourceVersion": "1"
        },
        "spec": { "objective": format!("work for {name}") },
        "status": status
    })
}

pub fn list_of(kind: &str, items: Vec<Value>) -> Value {
    json!({
        "apiVersion": "gastown.gastown.io/v1alpha1",
        "kind": format!("{kind}List"),
        "metadata": { "resourceVersion": "10" },
        "items": items
    })
}

pub fn not_found(message: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": "NotFound",
        "code": 404
    })
}

pub fn server_error(message: &str) -> Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": "InternalError",
        "code": 500
    })
}
