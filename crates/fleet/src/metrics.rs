//! Fleet-wide metric aggregation.

use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::model::{MetricField, Worker, WorkerMetrics, WorkerPhase};

const CSV_HEADER: &str =
    "name,namespace,phase,iterations,tokensUsed,costUsd,durationSeconds,createdAt";

/// The four numeric metric fields, summed or averaged.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricValues {
    pub iterations: f64,
    pub tokens_used: f64,
    pub cost_usd: f64,
    pub duration_seconds: f64,
}

impl MetricValues {
    fn add(&mut self, m: &WorkerMetrics) {
        self.iterations += m.iterations as f64;
        self.tokens_used += m.tokens_used as f64;
        self.cost_usd += m.cost_usd;
        self.duration_seconds += m.duration_seconds;
    }

    fn divided_by(&self, n: usize) -> Self {
        if n == 0 {
            return Self::default();
        }
        let n = n as f64;
        Self {
            iterations: self.iterations / n,
            tokens_used: self.tokens_used / n,
            cost_usd: self.cost_usd / n,
            duration_seconds: self.duration_seconds / n,
        }
    }
}

/// Phase distribution, totals and per-completed-worker averages.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total: usize,
    /// Keyed by each worker's state string (`Running`, `idle`, ...).
    pub by_phase: BTreeMap<String, usize>,
    /// Workers in a terminal cluster phase.
    pub completed: usize,
    pub totals: MetricValues,
    pub averages: MetricValues,
}

impl MetricsSummary {
    #[must_use]
    pub fn count(&self, state: &str) -> usize {
        self.by_phase.get(state).copied().unwrap_or(0)
    }
}

/// Single pass over `workers`.
///
/// Totals include every worker that reports metrics; averages divide by the
/// number of Succeeded and Failed workers only, and are zero when there are
/// none.
#[must_use]
pub fn aggregate(workers: &[Worker]) -> MetricsSummary {
    let mut summary = MetricsSummary {
        total: workers.len(),
        ..MetricsSummary::default()
    };

    for worker in workers {
        *summary
            .by_phase
            .entry(worker.state_label().to_string())
            .or_insert(0) += 1;
        if let Some(m) = worker.metrics() {
            summary.totals.add(m);
        }
    }

    summary.completed =
        summary.count(WorkerPhase::Succeeded.as_str()) + summary.count(WorkerPhase::Failed.as_str());
    summary.averages = summary.totals.divided_by(summary.completed);
    summary
}

/// The `n` workers with the largest positive value of `field`.
///
/// Workers without metrics or with a zero value are skipped. Equal values
/// keep their input order.
#[must_use]
pub fn top_n(workers: &[Worker], field: MetricField, n: usize) -> Vec<&Worker> {
    let mut ranked: Vec<(&Worker, f64)> = workers
        .iter()
        .filter_map(|w| {
            let value = field.value(w.metrics()?);
            (value > 0.0).then_some((w, value))
        })
        .collect();
    // sort_by is stable
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    ranked.into_iter().take(n).map(|(w, _)| w).collect()
}

/// Rounded percentage of Succeeded workers, 0 for an empty fleet.
#[must_use]
pub fn success_rate(summary: &MetricsSummary) -> u32 {
    if summary.total == 0 {
        return 0;
    }
    let succeeded = summary.count(WorkerPhase::Succeeded.as_str()) as f64;
    (succeeded / summary.total as f64 * 100.0).round() as u32
}

/// Newest first by creation time; workers without one go last.
#[must_use]
pub fn recent(workers: &[Worker], n: usize) -> Vec<&Worker> {
    let mut sorted: Vec<&Worker> = workers.iter().collect();
    sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    sorted.truncate(n);
    sorted
}

/// CSV export, one row per cluster worker.
#[must_use]
pub fn to_csv(workers: &[Worker]) -> String {
    let mut out = String::from(CSV_HEADER);
    out.push('\n');

    for worker in workers {
        let Some(cluster) = worker.cluster() else {
            continue;
        };
        let m = cluster.metrics.unwrap_or_default();
        let created = worker
            .created_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        let _ = writeln!(
            out,
            "{},{},{},{},{},{},{},{}",
            csv_field(&worker.name),
            csv_field(&cluster.namespace),
            cluster.phase,
            m.iterations,
            m.tokens_used,
            m.cost_usd,
            m.duration_seconds,
            created,
        );
    }
    out
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
