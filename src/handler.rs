//! Per-bucket sequential request execution.

use http::StatusCode;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::{Instant, sleep};

use crate::error::{ApiError, DispatchError, TransportError};
use crate::events::RestEvent;
use crate::headers::RateLimitHeaders;
use crate::manager::Inner;
use crate::route::RouteData;
use crate::transport::PreparedRequest;
use crate::types::{ApiRequest, ApiResponse, InvalidRequestWarningData, RateLimitData, RateLimitScope};

/// Wait applied after a 429 that explains neither itself nor how long to back off.
const UNEXPLAINED_RATE_LIMIT_WAIT: Duration = Duration::from_secs(1);

/// Rolling window of the invalid request counter.
const INVALID_REQUEST_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Counters of one bucket, owned by whichever request holds the queue.
#[derive(Debug)]
struct BucketState {
    limit: Option<u32>,
    remaining: u32,
    reset: Instant,
}

impl BucketState {
    fn limited_for(&self, now: Instant) -> Option<Duration> {
        (self.remaining == 0 && self.reset > now).then(|| self.reset - now)
    }
}

/// The sequential queue of one `(bucket hash, major parameter)` pair.
///
/// The queue is a fair mutex over the bucket counters. A request holds it
/// from the moment it starts waiting on limits until its final response is
/// parsed, so at most one request per bucket is ever in flight and requests
/// run in the order they queued.
///
/// A request that hits a sublimit gives the queue up while it waits, parked
/// on `sublimit`, and queues again once the wait is over.
#[derive(Debug)]
pub(crate) struct Handler {
    id: String,
    hash: String,
    major_parameter: String,
    queue: tokio::sync::Mutex<BucketState>,
    sublimit: tokio::sync::Mutex<()>,
    pending: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl Handler {
    pub fn new(hash: &str, major_parameter: &str) -> Self {
        let now = Instant::now();
        Self {
            id: format!("{hash}:{major_parameter}"),
            hash: hash.to_string(),
            major_parameter: major_parameter.to_string(),
            queue: tokio::sync::Mutex::new(BucketState {
                limit: None,
                remaining: 1,
                reset: now,
            }),
            sublimit: tokio::sync::Mutex::new(()),
            pending: AtomicUsize::new(0),
            last_used: Mutex::new(now),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether the sweeper may drop this handler.
    ///
    /// Nothing may be queued or running, the bucket must not be waiting out
    /// a limit, and the handler must have been idle for at least `lifetime`.
    pub fn inactive(&self, now: Instant, lifetime: Duration) -> bool {
        if self.pending.load(Ordering::Acquire) > 0 {
            return false;
        }
        let (Ok(state), Ok(_)) = (self.queue.try_lock(), self.sublimit.try_lock()) else {
            return false;
        };
        if state.limited_for(now).is_some() {
            return false;
        }
        let last_used = *self.last_used.lock().unwrap_or_else(PoisonError::into_inner);
        now.saturating_duration_since(last_used) >= lifetime
    }

    /// Queue `request` behind earlier requests on this bucket and run it to
    /// completion.
    pub async fn execute(
        &self,
        inner: &Inner,
        route: &RouteData,
        hash_key: &str,
        request: PreparedRequest,
        authenticated: bool,
    ) -> Result<ApiResponse, DispatchError> {
        let mut bucket = self.queue.lock().await;
        let offset = inner.options.offset.for_route(&route.bucket_route);
        let mut retries = 0;

        loop {
            self.wait_for_limits(&bucket, inner, route, &request).await?;
            inner.global.acquire().await;

            let sent = tokio::time::timeout(inner.options.timeout, inner.transport.send(request.clone())).await;
            let response = match sent.unwrap_or(Err(TransportError::Timeout)) {
                Ok(response) => response,
                Err(err) if err.is_retryable() && retries < inner.options.retries => {
                    retries += 1;
                    inner.events.debug(format!(
                        "{} {} failed ({err}), retry {retries}/{}",
                        request.method, route.original, inner.options.retries
                    ));
                    sleep(backoff(inner.options.retry_backoff, retries)).await;
                    continue;
                }
                Err(source) => {
                    return Err(DispatchError::Transport {
                        method: request.method.clone(),
                        url: request.url.clone(),
                        source,
                    });
                }
            };

            let now = Instant::now();
            let status = response.status;
            let headers = RateLimitHeaders::parse(&response.headers);

            bucket.limit = headers.limit;
            bucket.remaining = headers.remaining.unwrap_or(1);
            bucket.reset = now + headers.reset_after.map_or(Duration::ZERO, |d| d + offset);

            if let Some(bucket_hash) = &headers.bucket {
                if *bucket_hash == self.hash {
                    inner.hashes.get(hash_key);
                } else {
                    let previous = inner.hashes.set(hash_key, bucket_hash);
                    inner.events.debug(format!(
                        "Bucket hash update for {hash_key}: {} -> {bucket_hash}",
                        previous.as_deref().unwrap_or(&self.hash)
                    ));
                }
            }

            let mut sublimit = None;
            if let Some(retry_after) = headers.retry_after.filter(|d| !d.is_zero()) {
                let retry_after = retry_after + offset;
                if headers.global {
                    inner.global.lock_for(retry_after);
                } else if bucket.limited_for(now).is_none() {
                    sublimit = Some(retry_after);
                }
            }

            if matches!(
                status,
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
            ) {
                inner.record_invalid_request(now);
            }

            inner.events.emit(RestEvent::Response {
                request: ApiRequest {
                    method: request.method.clone(),
                    path: route.original.clone(),
                    route: route.bucket_route.clone(),
                    url: request.url.clone(),
                    retries,
                },
                status,
                headers: response.headers.clone(),
            });

            if status.is_success() {
                return Ok(response);
            }

            if status == StatusCode::TOO_MANY_REQUESTS {
                let now = Instant::now();
                let global_wait = inner.global.limited_for(now);
                let mut data = self.limit_data(route, &request);
                data.global = headers.global || global_wait.is_some();
                data.limit = if data.global {
                    Some(inner.global.budget())
                } else {
                    bucket.limit
                };
                data.time_to_reset = global_wait
                    .or_else(|| bucket.limited_for(now))
                    .unwrap_or_default();
                data.retry_after = headers.retry_after.unwrap_or_default();
                data.sublimit_timeout = sublimit;
                data.scope = headers.scope;

                inner.events.emit(RestEvent::RateLimited(data.clone()));
                if inner.options.reject_on_rate_limit.rejects(&data) {
                    return Err(DispatchError::RateLimited(data));
                }

                inner.events.debug(format!(
                    "Encountered unexpected 429 rate limit on {} {} (bucket {}, scope {:?})",
                    request.method, route.bucket_route, self.id, headers.scope
                ));

                if !data.time_to_reset.is_zero() {
                    continue;
                }
                let Some(wait) = sublimit else {
                    inner.events.debug(format!(
                        "Waiting {UNEXPLAINED_RATE_LIMIT_WAIT:?} before retrying {}",
                        self.id
                    ));
                    sleep(UNEXPLAINED_RATE_LIMIT_WAIT).await;
                    continue;
                };

                // Let the rest of the queue run while this request waits.
                drop(bucket);
                let parked = self.sublimit.lock().await;
                inner.events.debug(format!(
                    "Sublimit on {} {}, parked for {wait:?}",
                    request.method, route.bucket_route
                ));
                sleep(wait).await;
                bucket = self.queue.lock().await;
                drop(parked);
                continue;
            }

            if status.is_server_error() {
                if retries < inner.options.retries {
                    retries += 1;
                    inner.events.debug(format!(
                        "{} {} returned {status}, retry {retries}/{}",
                        request.method, route.original, inner.options.retries
                    ));
                    sleep(backoff(inner.options.retry_backoff, retries)).await;
                    continue;
                }
                return Err(DispatchError::Http {
                    status,
                    method: request.method.clone(),
                    url: request.url.clone(),
                });
            }

            if status.is_client_error() {
                if status == StatusCode::UNAUTHORIZED && authenticated {
                    inner.clear_token();
                }
                return Err(ApiError::from_body(
                    status,
                    request.method.clone(),
                    request.url.clone(),
                    &response.body,
                )
                .into());
            }

            return Ok(response);
        }
    }

    /// Wait until neither the global budget nor this bucket is exhausted.
    async fn wait_for_limits(
        &self,
        bucket: &BucketState,
        inner: &Inner,
        route: &RouteData,
        request: &PreparedRequest,
    ) -> Result<(), DispatchError> {
        loop {
            let now = Instant::now();
            let (global, wait) = if let Some(wait) = inner.global.limited_for(now) {
                (true, wait)
            } else if let Some(wait) = bucket.limited_for(now) {
                (false, wait)
            } else {
                return Ok(());
            };

            let mut data = self.limit_data(route, request);
            data.global = global;
            data.limit = if global {
                Some(inner.global.budget())
            } else {
                bucket.limit
            };
            data.time_to_reset = wait;
            data.retry_after = wait;
            if global {
                data.scope = RateLimitScope::Global;
            }

            inner.events.emit(RestEvent::RateLimited(data.clone()));
            if inner.options.reject_on_rate_limit.rejects(&data) {
                return Err(DispatchError::RateLimited(data));
            }

            if global {
                inner.events.debug(format!("Global rate limit hit, blocking {} for {wait:?}", self.id));
                inner.global.wait().await;
            } else {
                inner.events.debug(format!("Bucket {} exhausted, waiting {wait:?}", self.id));
                sleep(wait).await;
            }
        }
    }

    fn limit_data(&self, route: &RouteData, request: &PreparedRequest) -> RateLimitData {
        RateLimitData {
            global: false,
            method: request.method.clone(),
            url: request.url.clone(),
            route: route.bucket_route.clone(),
            major_parameter: self.major_parameter.clone(),
            hash: self.hash.clone(),
            limit: None,
            time_to_reset: Duration::ZERO,
            retry_after: Duration::ZERO,
            sublimit_timeout: None,
            scope: RateLimitScope::User,
        }
    }
}

/// Exponential backoff with up to 50% jitter.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let delay = base.saturating_mul(1_u32 << attempt.saturating_sub(1).min(10));
    let jitter_max_nanos = delay.as_nanos().min(u128::from(u64::MAX)) as u64 / 2;
    let jitter_nanos = if jitter_max_nanos > 0 {
        rand::rng().random_range(0..=jitter_max_nanos)
    } else {
        0
    };
    delay + Duration::from_nanos(jitter_nanos)
}

/// Marks a request as routed to a handler until it is dropped.
///
/// The count is raised while the handler map entry is still held, so the
/// handler sweeper never drops a handler a request was just routed to.
#[derive(Debug)]
pub(crate) struct PendingGuard {
    handler: Arc<Handler>,
}

impl PendingGuard {
    pub fn new(handler: Arc<Handler>) -> Self {
        handler.pending.fetch_add(1, Ordering::AcqRel);
        Self { handler }
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        *self
            .handler
            .last_used
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.handler.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counts 401, 403 and 429 responses in a rolling 10 minute window.
#[derive(Debug, Default)]
pub(crate) struct InvalidRequestCounter {
    state: Mutex<(u32, Option<Instant>)>,
}

impl InvalidRequestCounter {
    /// Count one invalid request. Returns warning data when the new count is
    /// a multiple of `interval`.
    pub fn record(&self, now: Instant, interval: u32) -> Option<InvalidRequestWarningData> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (count, reset_at) = &mut *state;
        match reset_at {
            Some(reset) if *reset > now => {}
            _ => {
                *count = 0;
                *reset_at = Some(now + INVALID_REQUEST_WINDOW);
            }
        }
        *count += 1;

        if interval == 0 || *count % interval != 0 {
            return None;
        }
        Some(InvalidRequestWarningData {
            count: *count,
            remaining_time: reset_at.map_or(Duration::ZERO, |reset| reset - now),
        })
    }
}
