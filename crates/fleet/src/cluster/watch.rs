//! Adapts raw kube watch streams into normalized change events.

use futures::future;
use futures::stream::{BoxStream, Stream, StreamExt};
use kube::api::{DynamicObject, WatchEvent};
use tracing::{debug, warn};

use crate::model::ResourceEvent;

/// A lazy, non-restartable sequence of change events for one resource kind.
///
/// The stream ends after the first `ResourceEvent::Error`, or when the server
/// closes the watch. Re-establishing it is up to the caller.
pub type EventStream<T> = BoxStream<'static, ResourceEvent<T>>;

pub(crate) fn normalized_events<S, T>(raw: S, normalize: fn(&DynamicObject) -> T) -> EventStream<T>
where
    S: Stream<Item = kube::Result<WatchEvent<DynamicObject>>> + Send + 'static,
    T: Send + 'static,
{
    raw.scan(false, move |failed, item| {
        if *failed {
            return future::ready(None);
        }
        let event = match item {
            Ok(WatchEvent::Added(obj)) => Some(ResourceEvent::Added(normalize(&obj))),
            Ok(WatchEvent::Modified(obj)) => Some(ResourceEvent::Modified(normalize(&obj))),
            Ok(WatchEvent::Deleted(obj)) => Some(ResourceEvent::Deleted(normalize(&obj))),
            Ok(WatchEvent::Bookmark(_)) => {
                debug!("Skipping watch bookmark");
                None
            }
            Ok(WatchEvent::Error(e)) => {
                warn!(code = e.code, reason = %e.reason, "Watch error: {}", e.message);
                *failed = true;
                Some(ResourceEvent::Error(e.message))
            }
            Err(e) => {
                warn!(error = %e, "Watch transport error");
                *failed = true;
                Some(ResourceEvent::Error(e.to_string()))
            }
        };
        future::ready(Some(event))
    })
    .filter_map(future::ready)
    .boxed()
}
