//! Per-kind watch cache.
//!
//! Applies change events to an insertion-ordered collection keyed by id and
//! republishes the full collection to subscribers after every mutation.

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cluster::EventStream;
use crate::model::{Keyed, ResourceEvent};

const SNAPSHOT_CHANNEL_CAPACITY: usize = 16;

/// A read-only copy of the cache contents.
pub type Snapshot<T> = Arc<Vec<T>>;

/// How a drained watch stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEnd {
    /// The server closed the stream.
    Closed,
    /// The stream delivered an error event.
    Failed(String),
}

#[derive(Debug)]
pub struct WatchCache<T> {
    kind: &'static str,
    items: Vec<T>,
    tx: broadcast::Sender<Snapshot<T>>,
}

impl<T> WatchCache<T>
where
    T: Keyed + Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(kind: &'static str) -> Self {
        let (tx, _) = broadcast::channel(SNAPSHOT_CHANNEL_CAPACITY);
        Self {
            kind,
            items: Vec::new(),
            tx,
        }
    }

    /// Receives every snapshot published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Snapshot<T>> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot<T> {
        Arc::new(self.items.clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replace the whole collection, e.g. after a resync list.
    pub fn reset(&mut self, items: Vec<T>) {
        self.items = items;
        debug!(kind = self.kind, count = self.items.len(), "Cache reset");
        self.publish();
    }

    /// Apply one event. Returns whether the collection changed.
    ///
    /// `Added` and `Modified` both upsert, so a redelivered add or a modify
    /// that arrives before its add is not lost. Deleting an unknown id is a
    /// no-op. `Error` leaves the collection untouched.
    pub fn apply(&mut self, event: ResourceEvent<T>) -> bool {
        match event {
            ResourceEvent::Added(item) | ResourceEvent::Modified(item) => {
                self.upsert(item);
            }
            ResourceEvent::Deleted(item) => {
                let before = self.items.len();
                self.items.retain(|existing| existing.key() != item.key());
                if self.items.len() == before {
                    debug!(kind = self.kind, id = item.key(), "Delete for unknown id ignored");
                    return false;
                }
            }
            ResourceEvent::Error(message) => {
                warn!(kind = self.kind, error = %message, "Watch reported an error");
                return false;
            }
        }
        self.publish();
        true
    }

    /// Drain a watch stream into the cache until it ends.
    pub async fn run(&mut self, mut events: EventStream<T>) -> WatchEnd {
        while let Some(event) = events.next().await {
            if let ResourceEvent::Error(message) = event {
                warn!(kind = self.kind, error = %message, "Watch terminated with error");
                return WatchEnd::Failed(message);
            }
            self.apply(event);
        }
        info!(kind = self.kind, "Watch stream closed");
        WatchEnd::Closed
    }

    fn upsert(&mut self, item: T) {
        match self.items.iter_mut().find(|e| e.key() == item.key()) {
            Some(slot) => *slot = item,
            None => self.items.push(item),
        }
    }

    fn publish(&self) {
        // No subscribers is fine.
        let _ = self.tx.send(self.snapshot());
    }
}
