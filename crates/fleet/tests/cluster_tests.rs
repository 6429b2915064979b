//! Integration tests for the cluster client against a mock API server.

mod common;

use async_trait::async_trait;
use common::{
    list_of, mock_cluster, mock_cluster_with_other, not_found, polecat, server_error,
    CONVOYS_PATH, NAMESPACE, WORKERS_PATH,
};
use fleet::bridge::{LocalAgent, LocalAgentSource};
use fleet::cache::{WatchCache, WatchEnd};
use fleet::cluster::{BeadSling, ClusterClient, ConnectionHandle, ConvoyRequest, WorkerRequest};
use fleet::config::{ClusterConfig, FleetConfig};
use fleet::logs::LogOptions;
use fleet::model::{ConnectionMode, LabelSelector, Worker, WorkerPhase};
use fleet::{FleetError, FleetService};
use serde_json::{json, Value};
use serial_test::serial;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::NamedTempFile;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct NoLocalWorkers;

#[async_trait]
impl LocalAgentSource for NoLocalWorkers {
    async fn list_local_agents(&self) -> fleet::Result<Vec<LocalAgent>> {
        Ok(Vec::new())
    }
}

// =============================================================================
// Initialization
// =============================================================================

#[tokio::test]
#[serial]
async fn test_initialize_from_kubeconfig() {
    let cluster = mock_cluster().await;

    let status = cluster.client.status();
    assert!(status.connected);
    assert_eq!(status.mode, Some(ConnectionMode::Kubeconfig));
    assert_eq!(status.context.as_deref(), Some("mock"));
    assert_eq!(status.namespace, NAMESPACE);
    assert!(status.error.is_none());
    assert!(status.last_check.is_some());
    assert_eq!(cluster.client.contexts(), vec!["mock", "other"]);
}

#[tokio::test]
#[serial]
async fn test_failed_initialize_records_error_and_fails_fast() {
    std::env::remove_var("KUBERNETES_SERVICE_HOST");
    let config = ClusterConfig {
        kubeconfig_path: Some(PathBuf::from("/nonexistent/kubeconfig")),
        ..ClusterConfig::default()
    };
    let client = ClusterClient::initialize(&config, ConnectionHandle::new()).await;

    let status = client.status();
    assert!(!status.connected);
    assert!(status.error.is_some());
    assert!(status.last_check.is_some());

    let err = client.list_workers(None).await.unwrap_err();
    assert!(matches!(err, FleetError::NotInitialized));
    let err = client.get_convoy("c", None).await.unwrap_err();
    assert!(err.is_not_initialized());
}

#[tokio::test]
#[serial]
async fn test_initialize_from_kubeconfig_path_list() {
    std::env::remove_var("KUBERNETES_SERVICE_HOST");
    std::env::remove_var("FLEET_CONFIG");
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(WORKERS_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(list_of("Polecat", vec![polecat("ace", None, json!({}))])),
        )
        .mount(&server)
        .await;

    let mut clusters = NamedTempFile::new().unwrap();
    write!(
        clusters,
        "apiVersion: v1\nkind: Config\nclusters:\n- name: split\n  cluster:\n    server: {}\ncontexts:\n- name: split\n  context:\n    cluster: split\n    user: split-user\ncurrent-context: split\n",
        server.uri()
    )
    .unwrap();
    let mut users = NamedTempFile::new().unwrap();
    write!(
        users,
        "apiVersion: v1\nkind: Config\nusers:\n- name: split-user\n  user:\n    token: split-token\n"
    )
    .unwrap();
    let paths = std::env::join_paths([clusters.path(), users.path()]).unwrap();
    std::env::set_var("KUBECONFIG", &paths);

    let mut config = FleetConfig::load().unwrap();
    config.cluster.namespace = NAMESPACE.to_string();
    let client = ClusterClient::initialize(&config.cluster, ConnectionHandle::new()).await;
    std::env::remove_var("KUBECONFIG");

    let status = client.status();
    assert!(status.connected, "{:?}", status.error);
    assert_eq!(status.context.as_deref(), Some("split"));
    assert_eq!(client.list_workers(None).await.unwrap()[0].name, "ace");
}

#[tokio::test]
#[serial]
async fn test_set_context_and_namespace() {
    let cluster = mock_cluster().await;

    let status = cluster.client.set_context("other").await.unwrap();
    assert_eq!(status.context.as_deref(), Some("other"));

    let status = cluster.client.set_namespace("elsewhere");
    assert_eq!(status.namespace, "elsewhere");
    assert_eq!(cluster.client.default_namespace(), "elsewhere");
}

#[tokio::test]
#[serial]
async fn test_context_switch_retargets_every_clone() {
    let (cluster, other) = mock_cluster_with_other().await;
    Mock::given(method("GET"))
        .and(path(WORKERS_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(list_of("Polecat", vec![polecat("old", None, json!({}))])),
        )
        .mount(&cluster.server)
        .await;
    Mock::given(method("GET"))
        .and(path(WORKERS_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(list_of("Polecat", vec![polecat("new", None, json!({}))])),
        )
        .mount(&other)
        .await;

    let switcher = cluster.client.clone();
    let bystander = cluster.client.clone();
    assert_eq!(bystander.list_workers(None).await.unwrap()[0].name, "old");

    switcher.set_context("other").await.unwrap();

    assert_eq!(bystander.status().context.as_deref(), Some("other"));
    let workers = bystander.list_workers(None).await.unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0].name, "new");
}

#[tokio::test]
#[serial]
async fn test_service_switches_context() {
    let (cluster, other) = mock_cluster_with_other().await;
    Mock::given(method("GET"))
        .and(path(WORKERS_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(list_of("Polecat", vec![polecat("new", None, json!({}))])),
        )
        .expect(1)
        .mount(&other)
        .await;

    let service = FleetService::new(
        cluster.client.clone(),
        Arc::new(NoLocalWorkers),
        LogOptions::default(),
    );
    assert_eq!(service.contexts(), vec!["mock", "other"]);

    let status = service.set_context("other").await.unwrap();
    assert_eq!(status.context.as_deref(), Some("other"));
    let workers = service.list_normalized_workers(None).await.unwrap();
    assert_eq!(workers[0].name, "new");
    assert_eq!(cluster.client.status().context.as_deref(), Some("other"));
}

#[tokio::test]
#[serial]
async fn test_connection_and_namespaces() {
    let cluster = mock_cluster().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "apiVersion": "v1",
            "kind": "NamespaceList",
            "metadata": { "resourceVersion": "1" },
            "items": [
                { "metadata": { "name": "default" } },
                { "metadata": { "name": "town" } }
            ]
        })))
        .mount(&cluster.server)
        .await;

    cluster.client.test_connection().await.unwrap();
    assert!(cluster.client.status().connected);
    assert_eq!(
        cluster.client.list_namespaces().await.unwrap(),
        vec!["default", "town"]
    );
}

// =============================================================================
// Reads
// =============================================================================

#[tokio::test]
#[serial]
async fn test_list_and_get_workers_are_normalized() {
    let cluster = mock_cluster().await;
    Mock::given(method("GET"))
        .and(path(WORKERS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_of(
            "Polecat",
            vec![
                polecat("ace", Some("Running"), json!({ "wave": "1" })),
                polecat("bo", None, json!({})),
            ],
        )))
        .mount(&cluster.server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{WORKERS_PATH}/ace")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(polecat("ace", Some("Running"), json!({}))),
        )
        .mount(&cluster.server)
        .await;

    let workers = cluster.client.list_workers(None).await.unwrap();
    assert_eq!(workers.len(), 2);
    assert_eq!(workers[0].id, "town/ace");
    assert_eq!(workers[0].phase(), Some(WorkerPhase::Running));
    assert_eq!(workers[1].phase(), Some(WorkerPhase::Unknown));

    let ace = cluster.client.get_worker("ace", Some(NAMESPACE)).await.unwrap();
    assert_eq!(ace.objective.as_deref(), Some("work for ace"));
}

#[tokio::test]
#[serial]
async fn test_transport_errors_propagate() {
    let cluster = mock_cluster().await;
    Mock::given(method("GET"))
        .and(path(format!("{WORKERS_PATH}/ghost")))
        .respond_with(ResponseTemplate::new(404).set_body_json(not_found("ghost not found")))
        .mount(&cluster.server)
        .await;

    let err = cluster.client.get_worker("ghost", None).await.unwrap_err();
    assert!(matches!(err, FleetError::Transport(_)));
    assert!(err.is_not_found());
}

#[tokio::test]
#[serial]
async fn test_preview_convoy_members() {
    let cluster = mock_cluster().await;
    Mock::given(method("GET"))
        .and(path(WORKERS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_of(
            "Polecat",
            vec![
                polecat("first", None, json!({ "wave": "1" })),
                polecat("second", None, json!({ "wave": "2" })),
                polecat("third", None, json!({ "wave": "1", "team": "x" })),
            ],
        )))
        .mount(&cluster.server)
        .await;

    let members = cluster
        .client
        .preview_convoy_members(&LabelSelector::new([("wave", "1")]), None)
        .await
        .unwrap();
    let names: Vec<_> = members.iter().map(|w| w.name.as_str()).collect();
    assert_eq!(names, vec!["first", "third"]);
}

// =============================================================================
// Writes
// =============================================================================

#[tokio::test]
#[serial]
async fn test_create_worker_validates_before_calling_api() {
    let cluster = mock_cluster().await;

    let err = cluster
        .client
        .create_worker(&WorkerRequest {
            name: "ace".to_string(),
            ..WorkerRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidRequest { field: "objective" }));

    let err = cluster
        .client
        .create_worker(&WorkerRequest {
            objective: "do it".to_string(),
            ..WorkerRequest::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::InvalidRequest { field: "name" }));

    assert!(cluster.server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
#[serial]
async fn test_create_worker_applies_defaults() {
    let cluster = mock_cluster().await;
    Mock::given(method("POST"))
        .and(path(WORKERS_PATH))
        .respond_with(
            ResponseTemplate::new(201).set_body_json(polecat("ace", Some("Queued"), json!({}))),
        )
        .expect(1)
        .mount(&cluster.server)
        .await;

    let worker = cluster
        .client
        .create_worker(&WorkerRequest {
            name: "ace".to_string(),
            objective: "fix the build".to_string(),
            ..WorkerRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(worker.phase(), Some(WorkerPhase::Queued));

    let requests = cluster.server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["kind"], "Polecat");
    assert_eq!(body["metadata"]["name"], "ace");
    assert_eq!(body["spec"]["objective"], "fix the build");
    assert_eq!(body["spec"]["sdk"]["type"], "claude");
    assert_eq!(body["spec"]["sdk"]["modelConfig"]["model"], "claude-sonnet-4");
    assert_eq!(body["spec"]["limits"]["maxDuration"], "1h");
    assert_eq!(body["spec"]["limits"]["maxIterations"], 50);
}

#[tokio::test]
#[serial]
async fn test_sling_bead_creates_labelled_worker() {
    let cluster = mock_cluster().await;
    Mock::given(method("POST"))
        .and(path(WORKERS_PATH))
        .respond_with(
            ResponseTemplate::new(201)
                .set_body_json(polecat("bead-gt-42", Some("Queued"), json!({}))),
        )
        .mount(&cluster.server)
        .await;

    cluster
        .client
        .sling_bead(&BeadSling {
            bead_id: "GT-42".to_string(),
            bead_title: Some("Flaky test".to_string()),
            ..BeadSling::default()
        })
        .await
        .unwrap();

    let requests = cluster.server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["metadata"]["name"], "bead-gt-42");
    assert_eq!(body["metadata"]["labels"]["gastown.io/source"], "local-bead");
    assert_eq!(body["metadata"]["labels"]["gastown.io/bead-id"], "GT-42");
    assert_eq!(body["spec"]["objective"], "Flaky test");
}

#[tokio::test]
#[serial]
async fn test_graceful_delete_survives_patch_failure() {
    let cluster = mock_cluster().await;
    let item = format!("{WORKERS_PATH}/ace");
    Mock::given(method("GET"))
        .and(path(item.as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(polecat("ace", Some("Running"), json!({}))),
        )
        .mount(&cluster.server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(item.as_str()))
        .respond_with(ResponseTemplate::new(500).set_body_json(server_error("controller busy")))
        .expect(1)
        .mount(&cluster.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(item.as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(polecat("ace", Some("Running"), json!({}))),
        )
        .expect(1)
        .mount(&cluster.server)
        .await;

    let deleted = cluster.client.delete_worker("ace", None, true).await.unwrap();
    assert_eq!(deleted.name, "ace");
    assert_eq!(deleted.namespace, NAMESPACE);

    let methods: Vec<String> = cluster
        .server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|r| r.method.to_string())
        .collect();
    assert_eq!(methods, vec!["GET", "PATCH", "DELETE"]);
}

#[tokio::test]
#[serial]
async fn test_graceful_delete_patches_active_worker() {
    let cluster = mock_cluster().await;
    let item = format!("{WORKERS_PATH}/ace");
    Mock::given(method("GET"))
        .and(path(item.as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(polecat("ace", Some("Claimed"), json!({}))),
        )
        .mount(&cluster.server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(item.as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(polecat("ace", Some("Claimed"), json!({}))),
        )
        .mount(&cluster.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(item.as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(polecat("ace", Some("Claimed"), json!({}))),
        )
        .mount(&cluster.server)
        .await;

    let started = std::time::Instant::now();
    cluster.client.delete_worker("ace", None, true).await.unwrap();
    assert!(started.elapsed() >= fleet::cluster::GRACE_PERIOD);

    let requests = cluster.server.received_requests().await.unwrap();
    let patch = requests
        .iter()
        .find(|r| r.method.to_string() == "PATCH")
        .unwrap();
    let body: Value = serde_json::from_slice(&patch.body).unwrap();
    assert_eq!(body, json!({ "spec": { "desiredState": "Terminated" } }));
}

#[tokio::test]
#[serial]
async fn test_graceful_delete_skips_patch_for_idle_worker() {
    let cluster = mock_cluster().await;
    let item = format!("{WORKERS_PATH}/ace");
    Mock::given(method("GET"))
        .and(path(item.as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(polecat("ace", Some("Succeeded"), json!({}))),
        )
        .mount(&cluster.server)
        .await;
    Mock::given(method("PATCH"))
        .and(path(item.as_str()))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&cluster.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(item.as_str()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(polecat("ace", Some("Succeeded"), json!({}))),
        )
        .expect(1)
        .mount(&cluster.server)
        .await;

    cluster.client.delete_worker("ace", None, true).await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_create_and_delete_convoy() {
    let cluster = mock_cluster().await;
    let convoy = json!({
        "apiVersion": "gastown.gastown.io/v1alpha1",
        "kind": "Convoy",
        "metadata": { "name": "wave-1", "namespace": NAMESPACE },
        "spec": { "title": "Wave 1", "selector": { "matchLabels": { "wave": "1" } } }
    });
    Mock::given(method("POST"))
        .and(path(CONVOYS_PATH))
        .respond_with(ResponseTemplate::new(201).set_body_json(convoy.clone()))
        .mount(&cluster.server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{CONVOYS_PATH}/wave-1")))
        .respond_with(ResponseTemplate::new(200).set_body_json(convoy))
        .expect(1)
        .mount(&cluster.server)
        .await;

    let created = cluster
        .client
        .create_convoy(&ConvoyRequest {
            name: "wave-1".to_string(),
            title: Some("Wave 1".to_string()),
            selector: LabelSelector::new([("wave", "1")]),
            ..ConvoyRequest::default()
        })
        .await
        .unwrap();
    assert_eq!(created.id, "town/wave-1");
    assert_eq!(created.pending(), 0);

    let requests = cluster.server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["spec"]["selector"]["matchLabels"]["wave"], "1");

    let deleted = cluster.client.delete_convoy("wave-1", None).await.unwrap();
    assert_eq!(deleted.name, "wave-1");
}

// =============================================================================
// Forges
// =============================================================================

#[tokio::test]
#[serial]
async fn test_forges_fall_back_to_cluster_scope() {
    let cluster = mock_cluster().await;
    Mock::given(method("GET"))
        .and(path("/apis/gastown.gastown.io/v1alpha1/namespaces/town/rigs"))
        .respond_with(ResponseTemplate::new(404).set_body_json(not_found("no rigs here")))
        .mount(&cluster.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/apis/gastown.gastown.io/v1alpha1/rigs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(list_of(
            "Rig",
            vec![json!({
                "apiVersion": "gastown.gastown.io/v1alpha1",
                "kind": "Rig",
                "metadata": { "name": "gastown" },
                "spec": { "gitURL": "https://example.com/gastown.git" },
                "status": { "phase": "Ready" }
            })],
        )))
        .mount(&cluster.server)
        .await;

    let forges = cluster.client.list_forges(None).await.unwrap();
    assert_eq!(forges.len(), 1);
    assert_eq!(forges[0].name, "gastown");
    assert!(forges[0].namespace.is_none());
    assert_eq!(forges[0].status, "Ready");
}

#[tokio::test]
#[serial]
async fn test_forges_empty_when_both_lookups_fail() {
    let cluster = mock_cluster().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404).set_body_json(not_found("rigs not served")))
        .mount(&cluster.server)
        .await;

    let forges = cluster.client.list_forges(None).await.unwrap();
    assert!(forges.is_empty());
}

// =============================================================================
// Watch
// =============================================================================

fn watch_line(kind: &str, object: &Value) -> String {
    json!({ "type": kind, "object": object }).to_string()
}

#[tokio::test]
#[serial]
async fn test_watch_drains_into_cache() {
    let cluster = mock_cluster().await;
    let body = [
        watch_line("ADDED", &polecat("ace", Some("Queued"), json!({}))),
        watch_line("ADDED", &polecat("bo", Some("Queued"), json!({}))),
        watch_line("MODIFIED", &polecat("ace", Some("Running"), json!({}))),
        watch_line("DELETED", &polecat("bo", Some("Queued"), json!({}))),
    ]
    .join("\n");
    Mock::given(method("GET"))
        .and(path(WORKERS_PATH))
        .and(query_param("watch", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .mount(&cluster.server)
        .await;

    let events = cluster.client.watch_workers(None).await.unwrap();
    let mut cache: WatchCache<Worker> = WatchCache::new("workers");
    let end = cache.run(events).await;

    assert_eq!(end, WatchEnd::Closed);
    let snapshot = cache.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, "town/ace");
    assert_eq!(snapshot[0].phase(), Some(WorkerPhase::Running));
}

#[tokio::test]
#[serial]
async fn test_watch_error_event_ends_stream() {
    let cluster = mock_cluster().await;
    let body = [
        watch_line("ADDED", &polecat("ace", Some("Queued"), json!({}))),
        json!({
            "type": "ERROR",
            "object": {
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "too old resource version",
                "reason": "Expired",
                "code": 410
            }
        })
        .to_string(),
        watch_line("ADDED", &polecat("bo", Some("Queued"), json!({}))),
    ]
    .join("\n");
    Mock::given(method("GET"))
        .and(path(WORKERS_PATH))
        .and(query_param("watch", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "application/json"))
        .mount(&cluster.server)
        .await;

    let events = cluster.client.watch_workers(None).await.unwrap();
    let mut cache: WatchCache<Worker> = WatchCache::new("workers");

    assert_eq!(
        cache.run(events).await,
        WatchEnd::Failed("too old resource version".to_string())
    );
    assert_eq!(cache.len(), 1);
}
