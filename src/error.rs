//! Error types for request dispatching.

use http::{Method, StatusCode};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::types::RateLimitData;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur while dispatching a request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DispatchError {
    /// The request needs the `Authorization` header but no token was set.
    #[error("expected a token to be set for this request, but none was present")]
    MissingToken,

    /// A rate limit was hit on a route the [`RateLimitPolicy`](crate::RateLimitPolicy)
    /// rejects instead of queueing.
    #[error("rate limited on {} {} (bucket {}), retry after {:?}", .0.method, .0.route, .0.hash, .0.time_to_reset)]
    RateLimited(RateLimitData),

    /// The API rejected the request with a 4xx status other than 429.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// The API kept answering with a server error until retries ran out.
    #[error("{method} {url} failed with {status} after exhausting retries")]
    Http {
        /// The last status code received.
        status: StatusCode,
        /// Method of the failed request.
        method: Method,
        /// Fully resolved URL of the failed request.
        url: String,
    },

    /// The transport failed to deliver the request.
    #[error("{method} {url} could not be sent: {source}")]
    Transport {
        /// Method of the failed request.
        method: Method,
        /// Fully resolved URL of the failed request.
        url: String,
        /// The last transport failure.
        #[source]
        source: TransportError,
    },

    /// A token, audit log reason or configured header is not a valid header value.
    #[error("invalid header value: {0}")]
    InvalidHeader(#[from] http::header::InvalidHeaderValue),

    /// The caller cancelled the request before it completed.
    #[error("request was cancelled")]
    Cancelled,

    /// A JSON payload could not be encoded or decoded.
    #[error("invalid JSON payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Failures reported by a [`Transport`](crate::Transport).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The attempt did not complete within the configured timeout.
    #[error("request timed out")]
    Timeout,
    /// The connection could not be established or was reset.
    #[error("connection failed: {0}")]
    Connect(#[source] BoxError),
    /// Any other transport failure.
    #[error(transparent)]
    Other(BoxError),
}

impl TransportError {
    /// Whether another attempt might succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Connect(_))
    }
}

impl From<reqwest_middleware::Error> for TransportError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(err) if err.is_timeout() => Self::Timeout,
            reqwest_middleware::Error::Reqwest(err) if err.is_connect() || err.is_request() => {
                Self::Connect(err.into())
            }
            reqwest_middleware::Error::Reqwest(err) => Self::Other(err.into()),
            reqwest_middleware::Error::Middleware(err) => Self::Other(err.into()),
        }
    }
}

/// The error code attached to an [`ApiError`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorCode {
    /// Numeric JSON error code of a regular API error.
    Numeric(i64),
    /// The `error` field of an OAuth2 error.
    OAuth(String),
    /// The payload carried no recognizable code.
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(code) => write!(f, "{code}"),
            Self::OAuth(code) => f.write_str(code),
            Self::Unknown => f.write_str("unknown"),
        }
    }
}

/// A terminal client error returned by the API.
#[derive(Debug, Clone, Error)]
#[error("{method} {url} failed with {status} [{code}]: {message}")]
pub struct ApiError {
    /// Status code of the response.
    pub status: StatusCode,
    /// Error code found in the payload.
    pub code: ErrorCode,
    /// Human readable message, with nested field errors flattened onto
    /// separate lines.
    pub message: String,
    /// Method of the failed request.
    pub method: Method,
    /// Fully resolved URL of the failed request.
    pub url: String,
    /// The payload as returned by the API.
    pub raw: Value,
}

impl ApiError {
    /// Build an error from a 4xx response body.
    pub(crate) fn from_body(status: StatusCode, method: Method, url: String, body: &[u8]) -> Self {
        let raw = serde_json::from_slice(body)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()));

        let (code, message) = match &raw {
            Value::Object(map) if map.contains_key("code") => {
                let code = map
                    .get("code")
                    .and_then(Value::as_i64)
                    .map_or(ErrorCode::Unknown, ErrorCode::Numeric);
                let message = map.get("message").and_then(Value::as_str).unwrap_or("");
                let mut flattened = Vec::new();
                if let Some(errors) = map.get("errors") {
                    flatten_errors(errors, "", &mut flattened);
                }
                let message = match (message.is_empty(), flattened.is_empty()) {
                    (false, false) => format!("{message}\n{}", flattened.join("\n")),
                    (false, true) => message.to_string(),
                    (true, false) => flattened.join("\n"),
                    (true, true) => "Unknown Error".to_string(),
                };
                (code, message)
            }
            Value::Object(map) => {
                let code = map
                    .get("error")
                    .and_then(Value::as_str)
                    .map_or(ErrorCode::Unknown, |e| ErrorCode::OAuth(e.to_string()));
                let message = map
                    .get("error_description")
                    .and_then(Value::as_str)
                    .unwrap_or("No Description")
                    .to_string();
                (code, message)
            }
            _ => (ErrorCode::Unknown, "Unknown Error".to_string()),
        };

        Self {
            status,
            code,
            message,
            method,
            url,
            raw,
        }
    }
}

/// Flatten the nested `errors` object of an API error into
/// `path[code]: message` lines.
fn flatten_errors(value: &Value, key: &str, out: &mut Vec<String>) {
    let Value::Object(map) = value else {
        if let Value::String(s) = value {
            out.push(s.clone());
        }
        return;
    };

    if let Some(message) = map.get("message").and_then(Value::as_str) {
        let code = match map.get("code") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let line = if key.is_empty() {
            format!("{code}: {message}")
        } else {
            format!("{key}[{code}]: {message}")
        };
        out.push(line.trim().to_string());
        return;
    }

    for (k, v) in map {
        let next_key = if k.starts_with('_') {
            key.to_string()
        } else if key.is_empty() {
            k.clone()
        } else if k.parse::<u64>().is_ok() {
            format!("{key}[{k}]")
        } else {
            format!("{key}.{k}")
        };

        match v {
            Value::String(s) => out.push(s.clone()),
            Value::Object(inner) if inner.contains_key("_errors") => {
                if let Some(Value::Array(errors)) = inner.get("_errors") {
                    for error in errors {
                        flatten_errors(error, &next_key, out);
                    }
                }
            }
            _ => flatten_errors(v, &next_key, out),
        }
    }
}
