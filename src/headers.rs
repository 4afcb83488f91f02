//! Parsing of the rate limit headers attached to every API response.

use http::HeaderMap;
use std::time::Duration;

use crate::types::RateLimitScope;

const LIMIT: &str = "x-ratelimit-limit";
const REMAINING: &str = "x-ratelimit-remaining";
const RESET_AFTER: &str = "x-ratelimit-reset-after";
const BUCKET: &str = "x-ratelimit-bucket";
const GLOBAL: &str = "x-ratelimit-global";
const SCOPE: &str = "x-ratelimit-scope";
const RETRY_AFTER: &str = "retry-after";

/// Rate limit information reported by a response.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RateLimitHeaders {
    pub limit: Option<u32>,
    pub remaining: Option<u32>,
    pub reset_after: Option<Duration>,
    pub bucket: Option<String>,
    pub retry_after: Option<Duration>,
    pub global: bool,
    pub scope: RateLimitScope,
}

impl RateLimitHeaders {
    pub fn parse(headers: &HeaderMap) -> Self {
        Self {
            limit: parse_header_value(headers, LIMIT),
            remaining: parse_header_value(headers, REMAINING),
            reset_after: parse_seconds(headers, RESET_AFTER),
            bucket: header_str(headers, BUCKET).map(str::to_string),
            retry_after: parse_seconds(headers, RETRY_AFTER),
            global: headers.contains_key(GLOBAL),
            scope: header_str(headers, SCOPE).map_or_else(RateLimitScope::default, RateLimitScope::parse),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Helper to parse numeric header values
fn parse_header_value(headers: &HeaderMap, name: &str) -> Option<u32> {
    header_str(headers, name).and_then(|value| value.trim().parse().ok())
}

/// Parse a header holding a (possibly fractional) number of seconds.
fn parse_seconds(headers: &HeaderMap, name: &str) -> Option<Duration> {
    let seconds: f64 = header_str(headers, name)?.trim().parse().ok()?;
    Duration::try_from_secs_f64(seconds).ok()
}
