//! Diagnostic events emitted by the dispatcher.

use http::{HeaderMap, StatusCode};
use tokio::sync::broadcast;

use crate::hash::BucketHash;
use crate::types::{ApiRequest, InvalidRequestWarningData, RateLimitData};

/// A diagnostic event.
///
/// Events are delivered through [`RequestManager::subscribe`](crate::RequestManager::subscribe)
/// and, with the `tracing` feature, mirrored as `tracing` records. Emitting
/// never blocks the request pipeline; slow subscribers miss events instead.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum RestEvent {
    /// Free-form trace of what a handler is doing.
    Debug(String),
    /// A bucket or the global limit was hit.
    RateLimited(RateLimitData),
    /// The invalid request count crossed a multiple of the warning interval.
    InvalidRequestWarning(InvalidRequestWarningData),
    /// Bucket hashes evicted by the hash sweeper, keyed by `METHOD:route`.
    HashSweep(Vec<(String, BucketHash)>),
    /// Ids of the handlers evicted by the handler sweeper.
    HandlerSweep(Vec<String>),
    /// A response was received.
    Response {
        /// The request that produced the response.
        request: ApiRequest,
        /// Status code of the response.
        status: StatusCode,
        /// Headers of the response.
        headers: HeaderMap,
    },
}

/// Fan-out for [`RestEvent`]s.
#[derive(Debug)]
pub(crate) struct Events {
    sender: broadcast::Sender<RestEvent>,
}

impl Events {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RestEvent> {
        self.sender.subscribe()
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.emit(RestEvent::Debug(message.into()));
    }

    pub fn emit(&self, event: RestEvent) {
        #[cfg(feature = "tracing")]
        trace_event(&event);

        // Sending only fails when nobody is subscribed.
        let _ = self.sender.send(event);
    }
}

#[cfg(feature = "tracing")]
fn trace_event(event: &RestEvent) {
    match event {
        RestEvent::Debug(message) => tracing::debug!("{message}"),
        RestEvent::RateLimited(data) => tracing::warn!(
            global = data.global,
            method = %data.method,
            route = %data.route,
            major_parameter = %data.major_parameter,
            hash = %data.hash,
            limit = ?data.limit,
            time_to_reset = ?data.time_to_reset,
            retry_after = ?data.retry_after,
            "rate limited"
        ),
        RestEvent::InvalidRequestWarning(data) => tracing::warn!(
            count = data.count,
            remaining_time = ?data.remaining_time,
            "invalid request count is growing, the credential risks being banned"
        ),
        RestEvent::HashSweep(swept) => {
            tracing::debug!(count = swept.len(), "swept idle bucket hashes");
        }
        RestEvent::HandlerSweep(swept) => {
            tracing::debug!(count = swept.len(), "swept inactive handlers");
        }
        RestEvent::Response { request, status, .. } => tracing::trace!(
            method = %request.method,
            path = %request.path,
            route = %request.route,
            retries = request.retries,
            status = status.as_u16(),
            "response received"
        ),
    }
}
