//! Turns a path plus [`RequestOptions`] into a [`PreparedRequest`].

use bytes::Bytes;
use http::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde_json::Value;

use crate::builder::Options;
use crate::error::DispatchError;
use crate::transport::{FormPart, PreparedBody, PreparedRequest};
use crate::types::{RawFile, RequestBody, RequestOptions};

/// Identifies this client to the API.
pub(crate) const DEFAULT_USER_AGENT: &str = concat!(
    "DiscordBot (",
    env!("CARGO_PKG_REPOSITORY"),
    ", ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

const AUDIT_LOG_REASON: HeaderName = HeaderName::from_static("x-audit-log-reason");

const PAYLOAD_JSON: &str = "payload_json";

/// Characters `encodeURIComponent` leaves alone.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// Characters escaped in query string keys and values.
const QUERY: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'*');

pub(crate) fn resolve(
    options: &Options,
    token: Option<&str>,
    method: &Method,
    path: &str,
    request: &RequestOptions,
) -> Result<PreparedRequest, DispatchError> {
    let url = resolve_url(options, path, request);

    let mut headers = request.headers.clone();
    let body = match (&request.body, request.files.is_empty()) {
        (body, false) => Some(PreparedBody::Multipart(multipart(
            &request.files,
            body.as_ref(),
            request.append_to_form_data,
        )?)),
        (Some(RequestBody::Json(value)), true) => {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            Some(PreparedBody::Bytes(Bytes::from(serde_json::to_vec(value)?)))
        }
        (Some(RequestBody::Raw { data, content_type }), true) => {
            if let Some(content_type) = content_type {
                headers.insert(CONTENT_TYPE, content_type.clone());
            }
            Some(PreparedBody::Bytes(data.clone()))
        }
        (None, true) => None,
    };

    for (name, value) in &options.headers {
        headers.insert(name, value.clone());
    }
    // The transport sets the multipart content type along with its boundary.
    if matches!(body, Some(PreparedBody::Multipart(_))) {
        headers.remove(CONTENT_TYPE);
    }

    let user_agent = format!("{DEFAULT_USER_AGENT} {}", options.user_agent_appendix);
    headers.insert(USER_AGENT, HeaderValue::from_str(user_agent.trim())?);

    if request.auth {
        let token = token.ok_or(DispatchError::MissingToken)?;
        let prefix = request.auth_prefix.unwrap_or(options.auth_prefix);
        let mut value = HeaderValue::from_str(&format!("{prefix} {token}"))?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
    }

    if let Some(reason) = request.reason.as_deref().filter(|r| !r.is_empty()) {
        let encoded = utf8_percent_encode(reason, COMPONENT).to_string();
        headers.insert(AUDIT_LOG_REASON, HeaderValue::from_str(&encoded)?);
    }

    Ok(PreparedRequest {
        method: method.clone(),
        url,
        headers,
        body,
    })
}

fn resolve_url(options: &Options, path: &str, request: &RequestOptions) -> String {
    let mut url = options.api.trim_end_matches('/').to_string();
    if request.versioned {
        url.push_str("/v");
        url.push_str(&options.version);
    }
    url.push_str(path);

    for (index, (key, value)) in request.query.iter().enumerate() {
        url.push(if index == 0 { '?' } else { '&' });
        url.extend(utf8_percent_encode(key, QUERY));
        url.push('=');
        url.extend(utf8_percent_encode(value, QUERY));
    }
    url
}

/// Lay out files, and the body if present, as `multipart/form-data` fields.
fn multipart(
    files: &[RawFile],
    body: Option<&RequestBody>,
    append_to_form_data: bool,
) -> Result<Vec<FormPart>, DispatchError> {
    let mut parts: Vec<FormPart> = files
        .iter()
        .enumerate()
        .map(|(index, file)| FormPart {
            name: file.key.clone().unwrap_or_else(|| format!("files[{index}]")),
            data: file.data.clone(),
            file_name: Some(file.name.clone()),
            content_type: Some(
                file.content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
            ),
        })
        .collect();

    match body {
        Some(RequestBody::Json(Value::Object(fields))) if append_to_form_data => {
            parts.extend(fields.iter().map(|(key, value)| FormPart {
                name: key.clone(),
                data: match value {
                    Value::String(s) => Bytes::from(s.clone()),
                    other => Bytes::from(other.to_string()),
                },
                file_name: None,
                content_type: None,
            }));
        }
        Some(RequestBody::Json(value)) => parts.push(FormPart {
            name: PAYLOAD_JSON.to_string(),
            data: Bytes::from(serde_json::to_vec(value)?),
            file_name: None,
            content_type: Some("application/json".to_string()),
        }),
        Some(RequestBody::Raw { data, content_type }) => parts.push(FormPart {
            name: PAYLOAD_JSON.to_string(),
            data: data.clone(),
            file_name: None,
            content_type: content_type
                .as_ref()
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
        }),
        None => {}
    }

    Ok(parts)
}
