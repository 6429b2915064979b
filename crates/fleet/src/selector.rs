//! Label selector evaluation.
//!
//! Used for convoy previews and for the convoy membership the controller
//! computes, so both must agree on these semantics.

use std::collections::BTreeMap;

use crate::model::{LabelSelector, Worker};

/// Every selector key must be present in `labels` with an identical value.
/// An empty selector matches everything.
#[must_use]
pub fn matches(labels: &BTreeMap<String, String>, selector: &LabelSelector) -> bool {
    selector
        .match_labels
        .iter()
        .all(|(key, want)| labels.get(key) == Some(want))
}

/// The workers whose labels satisfy `selector`, in their original order.
#[must_use]
pub fn select(workers: Vec<Worker>, selector: &LabelSelector) -> Vec<Worker> {
    workers
        .into_iter()
        .filter(|w| matches(w.labels(), selector))
        .collect()
}
