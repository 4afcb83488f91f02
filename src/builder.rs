//! Builder API for configuring the request manager.

use http::{HeaderMap, HeaderName, HeaderValue};
use reqwest_middleware::ClientWithMiddleware;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::manager::RequestManager;
use crate::transport::{ReqwestTransport, Transport};
use crate::types::{AuthPrefix, Offset, RateLimitData, RateLimitPolicy};

/// Sweep intervals longer than this are rejected.
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// Resolved configuration shared by the manager and its handlers.
#[derive(Debug, Clone)]
pub(crate) struct Options {
    pub api: String,
    pub version: String,
    pub auth_prefix: AuthPrefix,
    pub headers: HeaderMap,
    pub user_agent_appendix: String,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_backoff: Duration,
    pub offset: Offset,
    pub global_requests_per_second: u32,
    pub hash_lifetime: Duration,
    pub hash_sweep_interval: Duration,
    pub handler_lifetime: Duration,
    pub handler_sweep_interval: Duration,
    pub invalid_request_warning_interval: u32,
    pub reject_on_rate_limit: RateLimitPolicy,
    pub event_capacity: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            api: "https://discord.com/api".to_string(),
            version: "10".to_string(),
            auth_prefix: AuthPrefix::Bot,
            headers: HeaderMap::new(),
            user_agent_appendix: String::new(),
            timeout: Duration::from_secs(15),
            retries: 3,
            retry_backoff: Duration::from_millis(100),
            offset: Offset::default(),
            global_requests_per_second: 50,
            hash_lifetime: Duration::from_secs(24 * 60 * 60),
            hash_sweep_interval: MAX_SWEEP_INTERVAL,
            handler_lifetime: Duration::ZERO,
            handler_sweep_interval: Duration::from_secs(60 * 60),
            invalid_request_warning_interval: 0,
            reject_on_rate_limit: RateLimitPolicy::Queue,
            event_capacity: 256,
        }
    }
}

/// Builder for configuring a [`RequestManager`].
///
/// Every option has a default matching the API's documented limits.
#[derive(Clone, Default)]
pub struct DispatcherBuilder {
    pub(crate) options: Options,
    transport: Option<Arc<dyn Transport>>,
    token: Option<String>,
}

impl fmt::Debug for DispatcherBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherBuilder")
            .field("options", &self.options)
            .field("custom_transport", &self.transport.is_some())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl DispatcherBuilder {
    /// Create a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the base API URL, without version.
    #[must_use]
    pub fn api(mut self, api: impl Into<String>) -> Self {
        self.options.api = api.into();
        self
    }

    /// Set the API version appended to versioned requests.
    #[must_use]
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.options.version = version.into();
        self
    }

    /// Set the default authorization prefix.
    #[must_use]
    pub fn auth_prefix(mut self, prefix: AuthPrefix) -> Self {
        self.options.auth_prefix = prefix;
        self
    }

    /// Add a header sent with every request.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.options.headers.insert(name, value);
        self
    }

    /// Append extra information to the `User-Agent` header.
    #[must_use]
    pub fn user_agent_appendix(mut self, appendix: impl Into<String>) -> Self {
        self.options.user_agent_appendix = appendix.into();
        self
    }

    /// Set the timeout of a single network attempt.
    ///
    /// Time spent waiting in a bucket queue or for a rate limit to reset does
    /// not count towards it.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Set how many times server errors and network failures are retried.
    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.options.retries = retries;
        self
    }

    /// Set the base delay between retries. It doubles with every attempt.
    #[must_use]
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.options.retry_backoff = backoff;
        self
    }

    /// Set the safety margin added to every computed rate limit wait.
    #[must_use]
    pub fn offset(mut self, offset: Duration) -> Self {
        self.options.offset = Offset::Fixed(offset);
        self
    }

    /// Choose the safety margin per bucket route.
    #[must_use]
    pub fn offset_fn<F>(mut self, offset: F) -> Self
    where
        F: Fn(&str) -> Duration + Send + Sync + 'static,
    {
        self.options.offset = Offset::PerRoute(Arc::new(offset));
        self
    }

    /// Set the global requests-per-second budget.
    ///
    /// # Panics
    ///
    /// Panics if `requests` is 0.
    #[must_use]
    pub fn global_requests_per_second(mut self, requests: u32) -> Self {
        assert!(requests > 0, "global requests per second must be greater than 0");
        self.options.global_requests_per_second = requests;
        self
    }

    /// Set how long a bucket hash may go unused before it is swept.
    #[must_use]
    pub fn hash_lifetime(mut self, lifetime: Duration) -> Self {
        self.options.hash_lifetime = lifetime;
        self
    }

    /// Set how often idle bucket hashes are swept. Zero disables the sweeper.
    ///
    /// # Panics
    ///
    /// Panics if `interval` exceeds 4 hours.
    #[must_use]
    pub fn hash_sweep_interval(mut self, interval: Duration) -> Self {
        assert!(
            interval <= MAX_SWEEP_INTERVAL,
            "sweep interval must not exceed 4 hours"
        );
        self.options.hash_sweep_interval = interval;
        self
    }

    /// Set how long a handler must be idle before it can be swept.
    #[must_use]
    pub fn handler_lifetime(mut self, lifetime: Duration) -> Self {
        self.options.handler_lifetime = lifetime;
        self
    }

    /// Set how often inactive handlers are swept. Zero disables the sweeper.
    ///
    /// # Panics
    ///
    /// Panics if `interval` exceeds 4 hours.
    #[must_use]
    pub fn handler_sweep_interval(mut self, interval: Duration) -> Self {
        assert!(
            interval <= MAX_SWEEP_INTERVAL,
            "sweep interval must not exceed 4 hours"
        );
        self.options.handler_sweep_interval = interval;
        self
    }

    /// Emit an invalid request warning every `interval` invalid requests
    /// within the 10 minute window. Zero disables the warnings.
    #[must_use]
    pub fn invalid_request_warning_interval(mut self, interval: u32) -> Self {
        self.options.invalid_request_warning_interval = interval;
        self
    }

    /// Set what happens when a request hits a rate limit.
    #[must_use]
    pub fn reject_on_rate_limit(mut self, policy: RateLimitPolicy) -> Self {
        self.options.reject_on_rate_limit = policy;
        self
    }

    /// Fail fast on rate limits for bucket routes starting with any of `prefixes`.
    #[must_use]
    pub fn reject_routes<I, S>(self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.reject_on_rate_limit(RateLimitPolicy::RejectRoutes(
            prefixes.into_iter().map(Into::into).collect(),
        ))
    }

    /// Fail fast on rate limits for which `predicate` returns `true`.
    #[must_use]
    pub fn reject_when<F>(self, predicate: F) -> Self
    where
        F: Fn(&RateLimitData) -> bool + Send + Sync + 'static,
    {
        self.reject_on_rate_limit(RateLimitPolicy::RejectWhen(Arc::new(predicate)))
    }

    /// Set how many diagnostic events are buffered for slow subscribers.
    #[must_use]
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.options.event_capacity = capacity;
        self
    }

    /// Send requests through a custom [`Transport`].
    #[must_use]
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Send requests through a middleware-wrapped reqwest client.
    #[must_use]
    pub fn client(self, client: ClientWithMiddleware) -> Self {
        self.transport(ReqwestTransport::from(client))
    }

    /// Set the token used for authenticated requests.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Build the manager.
    ///
    /// When called inside a Tokio runtime the sweepers start right away,
    /// otherwise they start with the first request.
    ///
    /// # Warnings
    ///
    /// If the `tracing` feature is enabled, this method will emit a warning
    /// for fail-fast route prefixes that can never match a bucket route.
    #[must_use]
    pub fn build(self) -> RequestManager {
        #[cfg(feature = "tracing")]
        self.warn_unmatchable_prefixes();

        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new()));
        RequestManager::new(self.options, transport, self.token)
    }

    /// Emit a warning for fail-fast prefixes that do not start with `/`.
    #[cfg(feature = "tracing")]
    fn warn_unmatchable_prefixes(&self) {
        if let RateLimitPolicy::RejectRoutes(prefixes) = &self.options.reject_on_rate_limit {
            for prefix in prefixes.iter().filter(|p| !p.starts_with('/')) {
                tracing::warn!(
                    prefix = %prefix,
                    "Fail-fast route prefix {:?} does not start with '/' and will never \
                     match a bucket route.",
                    prefix
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = DispatcherBuilder::new().options;
        assert_eq!(options.api, "https://discord.com/api");
        assert_eq!(options.version, "10");
        assert_eq!(options.timeout, Duration::from_secs(15));
        assert_eq!(options.retries, 3);
        assert_eq!(options.global_requests_per_second, 50);
        assert_eq!(options.hash_lifetime, Duration::from_secs(86_400));
        assert_eq!(options.hash_sweep_interval, Duration::from_secs(14_400));
        assert_eq!(options.handler_sweep_interval, Duration::from_secs(3_600));
        assert_eq!(options.offset.for_route("/gateway"), Duration::from_millis(50));
        assert!(matches!(options.reject_on_rate_limit, RateLimitPolicy::Queue));
    }

    #[test]
    fn test_builder_api() {
        let options = DispatcherBuilder::new()
            .api("http://localhost:1234/api/")
            .version("9")
            .auth_prefix(AuthPrefix::Bearer)
            .timeout(Duration::from_secs(2))
            .retries(1)
            .offset_fn(|route| {
                if route.starts_with("/channels") {
                    Duration::from_millis(250)
                } else {
                    Duration::ZERO
                }
            })
            .reject_routes(["/channels"])
            .invalid_request_warning_interval(500)
            .options;

        assert_eq!(options.api, "http://localhost:1234/api/");
        assert_eq!(options.version, "9");
        assert_eq!(options.auth_prefix, AuthPrefix::Bearer);
        assert_eq!(options.retries, 1);
        assert_eq!(options.offset.for_route("/channels/:id"), Duration::from_millis(250));
        assert_eq!(options.offset.for_route("/gateway"), Duration::ZERO);
        assert!(matches!(
            options.reject_on_rate_limit,
            RateLimitPolicy::RejectRoutes(ref p) if p == &["/channels".to_string()]
        ));
        assert_eq!(options.invalid_request_warning_interval, 500);
    }

    #[test]
    fn test_debug_redacts_token() {
        let builder = DispatcherBuilder::new().token("super-secret");
        assert!(!format!("{builder:?}").contains("super-secret"));
    }

    #[test]
    #[should_panic(expected = "sweep interval must not exceed 4 hours")]
    fn test_long_sweep_interval_panics() {
        let _ = DispatcherBuilder::new().hash_sweep_interval(Duration::from_secs(5 * 60 * 60));
    }

    #[test]
    #[should_panic(expected = "global requests per second must be greater than 0")]
    fn test_zero_global_budget_panics() {
        let _ = DispatcherBuilder::new().global_requests_per_second(0);
    }
}
