//! Classification of concrete request paths into rate limit buckets.

use http::Method;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds between the Unix epoch and the first second of 2015, the
/// epoch snowflake ids count from.
const SNOWFLAKE_EPOCH_MS: u64 = 1_420_070_400_000;

/// Messages older than this are deleted through a separate bucket.
const OLD_MESSAGE_AGE: Duration = Duration::from_secs(60 * 60 * 24 * 14);

/// Resource ids are 16 to 19 digit snowflakes.
const MIN_ID_DIGITS: usize = 16;
const MAX_ID_DIGITS: usize = 19;

/// Resources whose id partitions the buckets beneath them.
const MAJOR_RESOURCES: [&str; 3] = ["channels", "guilds", "webhooks"];

/// Generalized route data for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteData {
    /// The concrete path as requested.
    pub original: String,
    /// The path with resource ids stripped, identifying the bucket template.
    pub bucket_route: String,
    /// The id of the parent resource partitioning the bucket, or `global`.
    pub major_parameter: String,
}

impl RouteData {
    /// Generalize `path` into its bucket route and major parameter.
    ///
    /// # Panics
    ///
    /// Panics if `path` does not start with `/`.
    #[must_use]
    pub fn generate(path: &str, method: &Method) -> Self {
        assert!(path.starts_with('/'), "route must start with '/': {path:?}");

        let major_parameter = major_id(path).unwrap_or("global").to_string();

        let mut bucket_route = strip_ids(path);
        if let Some(index) = bucket_route.find("/reactions/") {
            bucket_route.truncate(index);
            bucket_route.push_str("/reactions/:reaction");
        }

        if *method == Method::DELETE
            && bucket_route == "/channels/:id/messages/:id"
            && trailing_id(path).is_some_and(is_older_than_two_weeks)
        {
            bucket_route.push_str("/Delete Old Message");
        }

        Self {
            original: path.to_string(),
            bucket_route,
            major_parameter,
        }
    }

    /// The key under which the bucket hash of this route is cached.
    pub(crate) fn hash_key(&self, method: &Method) -> String {
        format!("{method}:{}", self.bucket_route)
    }
}

/// The id directly under `/channels`, `/guilds` or `/webhooks`.
fn major_id(path: &str) -> Option<&str> {
    let mut segments = path[1..].split('/');
    let resource = segments.next()?;
    if !MAJOR_RESOURCES.contains(&resource) {
        return None;
    }
    let segment = segments.next()?;
    let digits = segment.bytes().take_while(u8::is_ascii_digit).count();
    (digits >= MIN_ID_DIGITS).then(|| &segment[..digits.min(MAX_ID_DIGITS)])
}

/// Replace every id-sized run of digits with `:id`.
fn strip_ids(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut out = String::with_capacity(path.len());
    let mut i = 0;
    while i < bytes.len() {
        if !bytes[i].is_ascii_digit() {
            let next = path[i..]
                .find(|c: char| c.is_ascii_digit())
                .map_or(path.len(), |offset| i + offset);
            out.push_str(&path[i..next]);
            i = next;
            continue;
        }

        let run_end = bytes[i..]
            .iter()
            .position(|b| !b.is_ascii_digit())
            .map_or(bytes.len(), |offset| i + offset);
        while run_end - i >= MIN_ID_DIGITS {
            out.push_str(":id");
            i += (run_end - i).min(MAX_ID_DIGITS);
        }
        out.push_str(&path[i..run_end]);
        i = run_end;
    }
    out
}

/// The id at the very end of the path.
fn trailing_id(path: &str) -> Option<u64> {
    let digits = path.bytes().rev().take_while(u8::is_ascii_digit).count();
    if digits < MIN_ID_DIGITS {
        return None;
    }
    let digits = digits.min(MAX_ID_DIGITS);
    path[path.len() - digits..].parse().ok()
}

fn is_older_than_two_weeks(id: u64) -> bool {
    let created_ms = (id >> 22) + SNOWFLAKE_EPOCH_MS;
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64);
    now_ms.saturating_sub(created_ms) > OLD_MESSAGE_AGE.as_millis() as u64
}
