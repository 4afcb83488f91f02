//! Core request, response and configuration types.

use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::DispatchError;

/// The prefix placed in front of the token in the `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthPrefix {
    /// `Bot <token>`
    #[default]
    Bot,
    /// `Bearer <token>`, for OAuth2 access tokens.
    Bearer,
}

impl fmt::Display for AuthPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bot => f.write_str("Bot"),
            Self::Bearer => f.write_str("Bearer"),
        }
    }
}

/// A request body.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Serialized as JSON, or as `payload_json` when files are attached.
    Json(Value),
    /// Sent untouched.
    Raw {
        /// The bytes to send.
        data: Bytes,
        /// Optional `Content-Type` for the bytes.
        content_type: Option<HeaderValue>,
    },
}

/// A file attached to a request as multipart form data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFile {
    /// File name reported to the API.
    pub name: String,
    /// File contents.
    pub data: Bytes,
    /// `Content-Type` of the file part.
    pub content_type: Option<String>,
    /// Explicit form field name. Defaults to `files[<index>]`.
    pub key: Option<String>,
}

impl RawFile {
    /// Create a file with the given name and contents.
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            content_type: None,
            key: None,
        }
    }

    /// Set the `Content-Type` of the file part.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set an explicit form field name.
    #[must_use]
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Per-request options passed to [`RequestManager::request`](crate::RequestManager::request).
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub(crate) body: Option<RequestBody>,
    pub(crate) files: Vec<RawFile>,
    pub(crate) append_to_form_data: bool,
    pub(crate) headers: HeaderMap,
    pub(crate) query: Vec<(String, String)>,
    pub(crate) auth: bool,
    pub(crate) auth_prefix: Option<AuthPrefix>,
    pub(crate) versioned: bool,
    pub(crate) reason: Option<String>,
    pub(crate) cancel: Option<CancellationToken>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            body: None,
            files: Vec::new(),
            append_to_form_data: false,
            headers: HeaderMap::new(),
            query: Vec::new(),
            auth: true,
            auth_prefix: None,
            versioned: true,
            reason: None,
            cancel: None,
        }
    }
}

impl RequestOptions {
    /// Create options with authentication and versioning enabled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a JSON body.
    #[must_use]
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// Send a body as-is.
    #[must_use]
    pub fn raw_body(mut self, data: impl Into<Bytes>, content_type: Option<HeaderValue>) -> Self {
        self.body = Some(RequestBody::Raw {
            data: data.into(),
            content_type,
        });
        self
    }

    /// Attach a file. Any attached file turns the body into multipart form data.
    #[must_use]
    pub fn file(mut self, file: RawFile) -> Self {
        self.files.push(file);
        self
    }

    /// Append the JSON body's top-level fields to the form instead of
    /// sending them as `payload_json`.
    #[must_use]
    pub fn append_to_form_data(mut self) -> Self {
        self.append_to_form_data = true;
        self
    }

    /// Add a header to this request.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Append a query string parameter.
    #[must_use]
    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    /// Send this request without the `Authorization` header.
    #[must_use]
    pub fn unauthenticated(mut self) -> Self {
        self.auth = false;
        self
    }

    /// Override the configured [`AuthPrefix`] for this request.
    #[must_use]
    pub fn auth_prefix(mut self, prefix: AuthPrefix) -> Self {
        self.auth_prefix = Some(prefix);
        self
    }

    /// Do not prefix the path with the API version.
    #[must_use]
    pub fn unversioned(mut self) -> Self {
        self.versioned = false;
        self
    }

    /// Reason shown in the audit log.
    #[must_use]
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Abort the request when `token` is cancelled.
    ///
    /// Cancelling a request that is still queued removes it from its bucket
    /// without affecting the requests around it.
    #[must_use]
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Who a rate limit applies to, as reported by the `X-RateLimit-Scope` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitScope {
    /// Per client.
    #[default]
    User,
    /// Every client of the API.
    Global,
    /// Shared per resource.
    Shared,
}

impl RateLimitScope {
    pub(crate) fn parse(value: &str) -> Self {
        match value {
            "global" => Self::Global,
            "shared" => Self::Shared,
            _ => Self::User,
        }
    }
}

/// Describes one observed rate limit.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitData {
    /// Whether the global limit was hit.
    pub global: bool,
    /// The HTTP method of the request.
    pub method: Method,
    /// The fully resolved URL of the request.
    pub url: String,
    /// The bucket route template.
    pub route: String,
    /// The major parameter of the route, or `global`.
    pub major_parameter: String,
    /// The bucket hash the request was queued under.
    pub hash: String,
    /// Requests allowed per window, if known.
    pub limit: Option<u32>,
    /// Time until the limit resets.
    pub time_to_reset: Duration,
    /// Time until this specific request may be retried.
    pub retry_after: Duration,
    /// Time until a sublimit resets, when one was hit.
    pub sublimit_timeout: Option<Duration>,
    /// Scope reported by the API.
    pub scope: RateLimitScope,
}

/// Emitted when invalid requests (401, 403, 429) cross a multiple of the
/// configured warning interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRequestWarningData {
    /// Invalid requests counted in the current window.
    pub count: u32,
    /// Time left before the window resets.
    pub remaining_time: Duration,
}

/// Describes a request attempt for [`RestEvent::Response`](crate::RestEvent::Response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    /// The HTTP method.
    pub method: Method,
    /// The concrete path that was requested.
    pub path: String,
    /// The bucket route template.
    pub route: String,
    /// The fully resolved URL.
    pub url: String,
    /// How many retries preceded this attempt.
    pub retries: u32,
}

/// What to do when a request hits a rate limit.
///
/// Routes that are rejected fail with [`DispatchError::RateLimited`] instead
/// of waiting for the limit to reset.
#[derive(Clone, Default)]
pub enum RateLimitPolicy {
    /// Always wait for the limit to reset.
    #[default]
    Queue,
    /// Reject when the bucket route starts with one of these prefixes.
    ///
    /// Prefixes match on path segment boundaries: `/channels` matches
    /// `/channels/:id/messages` but not `/channelsx`.
    RejectRoutes(Vec<String>),
    /// Reject when the predicate returns `true`.
    RejectWhen(Arc<dyn Fn(&RateLimitData) -> bool + Send + Sync>),
}

impl RateLimitPolicy {
    pub(crate) fn rejects(&self, data: &RateLimitData) -> bool {
        match self {
            Self::Queue => false,
            Self::RejectRoutes(prefixes) => prefixes
                .iter()
                .any(|prefix| route_has_prefix(&data.route, &prefix.to_lowercase())),
            Self::RejectWhen(predicate) => predicate(data),
        }
    }
}

impl fmt::Debug for RateLimitPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Queue => f.write_str("Queue"),
            Self::RejectRoutes(prefixes) => f.debug_tuple("RejectRoutes").field(prefixes).finish(),
            Self::RejectWhen(_) => f.write_str("RejectWhen(..)"),
        }
    }
}

/// Check `route` against `prefix` on path segment boundaries.
fn route_has_prefix(route: &str, prefix: &str) -> bool {
    if !route.starts_with(prefix) {
        return false;
    }
    let remaining = &route[prefix.len()..];
    remaining.is_empty() || remaining.starts_with('/') || prefix.ends_with('/')
}

/// Extra time added to computed rate limit waits.
#[derive(Clone)]
pub enum Offset {
    /// The same offset for every route.
    Fixed(Duration),
    /// An offset chosen per bucket route.
    PerRoute(Arc<dyn Fn(&str) -> Duration + Send + Sync>),
}

impl Offset {
    pub(crate) fn for_route(&self, route: &str) -> Duration {
        match self {
            Self::Fixed(offset) => *offset,
            Self::PerRoute(f) => f(route),
        }
    }
}

impl Default for Offset {
    fn default() -> Self {
        Self::Fixed(Duration::from_millis(50))
    }
}

impl fmt::Debug for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(offset) => f.debug_tuple("Fixed").field(offset).finish(),
            Self::PerRoute(_) => f.write_str("PerRoute(..)"),
        }
    }
}

/// A response as returned by the transport.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
}

/// A decoded response body.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// The response declared `application/json`.
    Json(Value),
    /// Any other content type.
    Raw(Bytes),
}

impl ApiResponse {
    /// Whether the response declares a JSON body.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/json"))
    }

    /// Decode the body according to its content type.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Decode`] if a JSON body is malformed.
    pub fn into_body(self) -> Result<ResponseBody, DispatchError> {
        if self.is_json() {
            Ok(ResponseBody::Json(serde_json::from_slice(&self.body)?))
        } else {
            Ok(ResponseBody::Raw(self.body))
        }
    }

    /// Deserialize the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Decode`] if the body is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, DispatchError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}
