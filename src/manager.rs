//! The request manager: routes requests to bucket handlers.

use dashmap::DashMap;
use http::Method;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::body;
use crate::builder::{DispatcherBuilder, Options};
use crate::error::DispatchError;
use crate::events::{Events, RestEvent};
use crate::global::GlobalThrottle;
use crate::handler::{Handler, InvalidRequestCounter, PendingGuard};
use crate::hash::HashCache;
use crate::route::RouteData;
use crate::sweeper::{Sweeper, SweeperSlot};
use crate::transport::Transport;
use crate::types::{ApiResponse, RequestOptions, ResponseBody};

/// State shared by the manager, its handlers and its sweepers.
pub(crate) struct Inner {
    pub options: Options,
    pub transport: Arc<dyn Transport>,
    pub hashes: HashCache,
    pub handlers: DashMap<String, Arc<Handler>>,
    pub global: GlobalThrottle,
    pub events: Events,
    token: RwLock<Option<String>>,
    invalid_requests: InvalidRequestCounter,
}

impl Inner {
    fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_token(&self, token: Option<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = token;
    }

    /// Forget the token after the API rejected it.
    pub fn clear_token(&self) {
        let had_token = self
            .token
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if had_token {
            #[cfg(feature = "tracing")]
            tracing::warn!("Received 401 Unauthorized, the token was cleared");
            self.events
                .debug("Received 401 Unauthorized, the token was cleared");
        }
    }

    pub fn record_invalid_request(&self, now: Instant) {
        let interval = self.options.invalid_request_warning_interval;
        if let Some(warning) = self.invalid_requests.record(now, interval) {
            self.events.emit(RestEvent::InvalidRequestWarning(warning));
        }
    }

    /// Find or create the handler for `hash` and `major_parameter` and mark a
    /// request as routed to it.
    fn route_to(&self, hash: &str, major_parameter: &str) -> PendingGuard {
        let id = format!("{hash}:{major_parameter}");
        let handler = self.handlers.entry(id).or_insert_with(|| {
            let handler = Handler::new(hash, major_parameter);
            self.events
                .debug(format!("Created handler {}", handler.id()));
            Arc::new(handler)
        });
        // Taken while the map entry is still held.
        PendingGuard::new(Arc::clone(handler.value()))
    }

    fn sweep_hashes(&self) -> usize {
        let swept = self.hashes.sweep(self.options.hash_lifetime);
        for (key, hash) in &swept {
            self.events.debug(format!(
                "Hash {} for {key} swept due to lifetime being exceeded",
                hash.value
            ));
        }
        let count = swept.len();
        self.events.emit(RestEvent::HashSweep(swept));
        count
    }

    fn sweep_handlers(&self) -> usize {
        let now = Instant::now();
        let lifetime = self.options.handler_lifetime;
        let mut swept = Vec::new();
        self.handlers.retain(|id, handler| {
            let inactive = handler.inactive(now, lifetime);
            if inactive {
                swept.push(id.clone());
            }
            !inactive
        });
        for id in &swept {
            self.events
                .debug(format!("Handler {id} swept due to being inactive"));
        }
        let count = swept.len();
        self.events.emit(RestEvent::HandlerSweep(swept));
        count
    }
}

#[derive(Debug, Default)]
struct Sweepers {
    hashes: SweeperSlot,
    handlers: SweeperSlot,
}

/// Dispatches requests to the API while respecting its rate limits.
///
/// Requests that share a rate limit bucket run one at a time in the order
/// they were made, while requests in different buckets run in parallel. All
/// requests draw from one global requests-per-second budget.
///
/// Clones share the same buckets, budget and sweepers. The sweepers stop
/// once the last clone is dropped.
///
/// # Example
///
/// ```rust,no_run
/// use bucket_dispatch::{RequestManager, RequestOptions};
///
/// # async fn example() -> Result<(), bucket_dispatch::DispatchError> {
/// let manager = RequestManager::builder().token("my-token").build();
///
/// let me = manager.get("/users/@me", RequestOptions::new()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RequestManager {
    inner: Arc<Inner>,
    sweepers: Arc<Mutex<Sweepers>>,
}

impl std::fmt::Debug for RequestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestManager")
            .field("options", &self.inner.options)
            .field("hashes", &self.inner.hashes.len())
            .field("handlers", &self.inner.handlers.len())
            .finish_non_exhaustive()
    }
}

impl RequestManager {
    /// Create a new builder for configuring the manager.
    #[must_use]
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::new()
    }

    pub(crate) fn new(options: Options, transport: Arc<dyn Transport>, token: Option<String>) -> Self {
        let inner = Inner {
            hashes: HashCache::new(),
            handlers: DashMap::new(),
            global: GlobalThrottle::new(options.global_requests_per_second),
            events: Events::new(options.event_capacity),
            token: RwLock::new(token),
            invalid_requests: InvalidRequestCounter::default(),
            transport,
            options,
        };
        let manager = Self {
            inner: Arc::new(inner),
            sweepers: Arc::default(),
        };
        manager.start_sweepers();
        manager
    }

    fn sweepers(&self) -> MutexGuard<'_, Sweepers> {
        self.sweepers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the sweep timers if they are not running yet and a Tokio
    /// runtime is available.
    fn start_sweepers(&self) {
        if tokio::runtime::Handle::try_current().is_err() {
            return;
        }
        let options = &self.inner.options;
        let mut sweepers = self.sweepers();
        sweepers.hashes.start_with(|| {
            Sweeper::spawn(
                options.hash_sweep_interval,
                Arc::downgrade(&self.inner),
                |inner: &Inner| {
                    inner.sweep_hashes();
                },
            )
        });
        sweepers.handlers.start_with(|| {
            Sweeper::spawn(
                options.handler_sweep_interval,
                Arc::downgrade(&self.inner),
                |inner: &Inner| {
                    inner.sweep_handlers();
                },
            )
        });
    }

    /// Set the token used for authenticated requests.
    pub fn set_token(&self, token: impl Into<String>) {
        self.inner.set_token(Some(token.into()));
    }

    /// Subscribe to diagnostic [`RestEvent`]s.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RestEvent> {
        self.inner.events.subscribe()
    }

    /// Send a request and decode its body.
    ///
    /// Rate limits are waited out transparently. Server errors and network
    /// failures are retried up to the configured number of times.
    ///
    /// # Errors
    ///
    /// See [`DispatchError`] for the conditions that end a request.
    ///
    /// # Panics
    ///
    /// Panics if `path` does not start with `/`.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<ResponseBody, DispatchError> {
        self.raw(method, path, options).await?.into_body()
    }

    /// Send a request and return the response without decoding it.
    ///
    /// # Errors
    ///
    /// See [`DispatchError`] for the conditions that end a request.
    ///
    /// # Panics
    ///
    /// Panics if `path` does not start with `/`.
    pub async fn raw(
        &self,
        method: Method,
        path: &str,
        options: RequestOptions,
    ) -> Result<ApiResponse, DispatchError> {
        self.start_sweepers();

        let route = RouteData::generate(path, &method);
        let hash_key = route.hash_key(&method);
        let hash = self
            .inner
            .hashes
            .get(&hash_key)
            .unwrap_or_else(|| format!("Global({hash_key})"));

        let token = self.inner.token();
        let prepared = body::resolve(&self.inner.options, token.as_deref(), &method, path, &options)?;

        let pending = self.inner.route_to(&hash, &route.major_parameter);
        let execute = pending
            .handler()
            .execute(&self.inner, &route, &hash_key, prepared, options.auth);

        match &options.cancel {
            Some(cancel) => tokio::select! {
                biased;
                () = cancel.cancelled() => Err(DispatchError::Cancelled),
                result = execute => result,
            },
            None => execute.await,
        }
    }

    /// Send a `GET` request.
    ///
    /// # Errors
    ///
    /// See [`RequestManager::request`].
    pub async fn get(&self, path: &str, options: RequestOptions) -> Result<ResponseBody, DispatchError> {
        self.request(Method::GET, path, options).await
    }

    /// Send a `POST` request.
    ///
    /// # Errors
    ///
    /// See [`RequestManager::request`].
    pub async fn post(&self, path: &str, options: RequestOptions) -> Result<ResponseBody, DispatchError> {
        self.request(Method::POST, path, options).await
    }

    /// Send a `PUT` request.
    ///
    /// # Errors
    ///
    /// See [`RequestManager::request`].
    pub async fn put(&self, path: &str, options: RequestOptions) -> Result<ResponseBody, DispatchError> {
        self.request(Method::PUT, path, options).await
    }

    /// Send a `PATCH` request.
    ///
    /// # Errors
    ///
    /// See [`RequestManager::request`].
    pub async fn patch(&self, path: &str, options: RequestOptions) -> Result<ResponseBody, DispatchError> {
        self.request(Method::PATCH, path, options).await
    }

    /// Send a `DELETE` request.
    ///
    /// # Errors
    ///
    /// See [`RequestManager::request`].
    pub async fn delete(&self, path: &str, options: RequestOptions) -> Result<ResponseBody, DispatchError> {
        self.request(Method::DELETE, path, options).await
    }

    /// Stop the bucket hash sweeper. It is not restarted.
    pub fn clear_hash_sweeper(&self) {
        self.sweepers().hashes.clear();
    }

    /// Stop the handler sweeper. It is not restarted.
    pub fn clear_handler_sweeper(&self) {
        self.sweepers().handlers.clear();
    }

    /// Remove bucket hashes idle beyond the configured lifetime now.
    ///
    /// Returns how many were removed.
    pub fn sweep_hashes(&self) -> usize {
        self.inner.sweep_hashes()
    }

    /// Remove inactive handlers now.
    ///
    /// Returns how many were removed.
    pub fn sweep_handlers(&self) -> usize {
        self.inner.sweep_handlers()
    }

    /// Returns the number of cached bucket hashes.
    #[must_use]
    pub fn hash_count(&self) -> usize {
        self.inner.hashes.len()
    }

    /// Returns the number of live bucket handlers.
    ///
    /// This can be useful for monitoring memory usage.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.inner.handlers.len()
    }

    #[cfg(test)]
    pub(crate) fn sweepers_running(&self) -> (bool, bool) {
        let sweepers = self.sweepers();
        (sweepers.hashes.is_running(), sweepers.handlers.is_running())
    }
}
