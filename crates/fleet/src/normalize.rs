//! Raw cluster records to canonical shapes.
//!
//! Every function here is total: missing `metadata`, `spec` or `status`
//! sub-objects fall back to defaults rather than failing.

use kube::api::DynamicObject;
use serde_json::Value;
use tracing::warn;

use crate::model::{
    ClusterWorker, Convoy, ConvoyMember, ConvoyPhase, Forge, LabelSelector, Worker, WorkerKind,
    WorkerMetrics, WorkerOrigin, WorkerPhase,
};

/// The two stored worker shapes, resolved once from the record's `kind`.
#[derive(Debug, Clone, Copy)]
enum WorkerRecord<'a> {
    /// Legacy shape; the environment reference lives in `spec.rigRef`.
    Polecat(&'a Value),
    /// Current shape; the environment reference lives in `spec.forgeRef`.
    Automaton(&'a Value),
}

impl<'a> WorkerRecord<'a> {
    fn resolve(obj: &'a DynamicObject, spec: &'a Value) -> Self {
        match obj.types.as_ref().map(|t| t.kind.as_str()) {
            Some("Automaton") => Self::Automaton(spec),
            _ => Self::Polecat(spec),
        }
    }

    fn kind(&self) -> WorkerKind {
        match self {
            Self::Polecat(_) => WorkerKind::Polecat,
            Self::Automaton(_) => WorkerKind::Automaton,
        }
    }

    /// `forgeRef` wins whenever it is present, whatever the shape.
    fn forge_ref(&self) -> Option<String> {
        let (Self::Polecat(spec) | Self::Automaton(spec)) = self;
        ref_field(spec, "forgeRef").or_else(|| ref_field(spec, "rigRef"))
    }
}

/// Normalizes a Polecat or Automaton record.
#[must_use]
pub fn normalize_worker(obj: &DynamicObject) -> Worker {
    let spec = section(&obj.data, "spec");
    let status = section(&obj.data, "status");
    let record = WorkerRecord::resolve(obj, spec);
    let (name, namespace) = identity(obj);

    let cluster = ClusterWorker {
        namespace: namespace.clone(),
        kind: record.kind(),
        phase: str_field(status, "phase").map_or(WorkerPhase::Unknown, |p| WorkerPhase::parse(&p)),
        health_state: str_field(status, "healthState").unwrap_or_else(|| "Unknown".to_string()),
        forge_ref: record.forge_ref(),
        agent_type: str_field(spec, "agentType"),
        execution_mode: str_field(spec, "executionMode"),
        claimed_by: str_field(status, "claimedBy"),
        pod_name: str_field(status, "podName"),
        limits: spec.get("limits").filter(|v| !v.is_null()).cloned(),
        metrics: metrics(status.get("metrics")),
        labels: obj.metadata.labels.clone().unwrap_or_default(),
        annotations: obj.metadata.annotations.clone().unwrap_or_default(),
        conditions: array(status, "conditions"),
    };

    Worker {
        id: format!("{namespace}/{name}"),
        name,
        objective: str_field(spec, "objective"),
        created_at: obj.metadata.creation_timestamp.as_ref().map(|t| t.0),
        origin: WorkerOrigin::Cluster(cluster),
    }
}

/// Normalizes a Convoy record.
#[must_use]
pub fn normalize_convoy(obj: &DynamicObject) -> Convoy {
    let spec = section(&obj.data, "spec");
    let status = section(&obj.data, "status");
    let (name, namespace) = identity(obj);

    let selector = spec
        .get("selector")
        .and_then(|s| serde_json::from_value::<LabelSelector>(s.clone()).ok())
        .unwrap_or_default();

    let members = status
        .get("members")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|m| {
                    Some(ConvoyMember {
                        name: str_field(m, "name")?,
                        phase: str_field(m, "phase")
                            .map_or(WorkerPhase::Unknown, |p| WorkerPhase::parse(&p)),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let convoy = Convoy {
        id: format!("{namespace}/{name}"),
        name,
        namespace,
        title: str_field(spec, "title"),
        phase: str_field(status, "phase").map_or(ConvoyPhase::Pending, |p| ConvoyPhase::parse(&p)),
        selector,
        total: i64_field(status, "total"),
        succeeded: i64_field(status, "succeeded"),
        failed: i64_field(status, "failed"),
        running: i64_field(status, "running"),
        members,
        conditions: array(status, "conditions"),
        labels: obj.metadata.labels.clone().unwrap_or_default(),
        created_at: obj.metadata.creation_timestamp.as_ref().map(|t| t.0),
    };

    if let Err(e) = convoy.check_counts() {
        warn!(convoy = %convoy.id, error = %e, "Convoy counts are inconsistent");
    }

    convoy
}

/// Normalizes a Rig/Forge record. Cluster-scoped records carry no namespace.
#[must_use]
pub fn normalize_forge(obj: &DynamicObject, cluster_scoped: bool) -> Forge {
    let spec = section(&obj.data, "spec");
    let status = section(&obj.data, "status");
    Forge {
        name: obj.metadata.name.clone().unwrap_or_default(),
        namespace: if cluster_scoped {
            None
        } else {
            obj.metadata.namespace.clone()
        },
        git_url: str_field(spec, "gitURL"),
        status: str_field(status, "phase").unwrap_or_else(|| "Unknown".to_string()),
    }
}

fn identity(obj: &DynamicObject) -> (String, String) {
    (
        obj.metadata.name.clone().unwrap_or_default(),
        obj.metadata.namespace.clone().unwrap_or_default(),
    )
}

fn section<'a>(data: &'a Value, key: &str) -> &'a Value {
    static NULL: Value = Value::Null;
    data.get(key).unwrap_or(&NULL)
}

fn str_field(v: &Value, key: &str) -> Option<String> {
    v.get(key).and_then(Value::as_str).map(str::to_string)
}

/// Reference fields are plain strings, or objects with a `name`.
fn ref_field(spec: &Value, key: &str) -> Option<String> {
    match spec.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(o) => o.get("name").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn f64_field(v: &Value, key: &str) -> Option<f64> {
    v.get(key).and_then(Value::as_f64)
}

fn i64_field(v: &Value, key: &str) -> i64 {
    v.get(key)
        .and_then(|n| n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)))
        .unwrap_or(0)
}

/// Non-negative counter; a negative raw value is reported and read as 0.
fn u64_field(v: &Value, key: &str) -> u64 {
    let raw = i64_field(v, key);
    if raw < 0 {
        warn!(field = key, value = raw, "Negative counter in resource status");
    }
    u64::try_from(raw).unwrap_or(0)
}

fn array(v: &Value, key: &str) -> Vec<Value> {
    v.get(key)
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn metrics(raw: Option<&Value>) -> Option<WorkerMetrics> {
    let raw = raw.filter(|v| v.is_object())?;
    Some(WorkerMetrics {
        iterations: u64_field(raw, "iterations"),
        tokens_used: u64_field(raw, "tokensUsed"),
        cost_usd: f64_field(raw, "costUsd").unwrap_or(0.0),
        duration_seconds: f64_field(raw, "durationSeconds")
            .or_else(|| f64_field(raw, "duration"))
            .unwrap_or(0.0),
    })
}
