//! The boundary between the dispatcher and the HTTP client that sends requests.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use reqwest::multipart::{Form, Part};
use reqwest_middleware::ClientWithMiddleware;

use crate::error::TransportError;
use crate::types::ApiResponse;

/// A fully resolved request, ready to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedRequest {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL including the query string.
    pub url: String,
    /// Every header to send.
    pub headers: HeaderMap,
    /// The body, if any.
    pub body: Option<PreparedBody>,
}

/// The body of a [`PreparedRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedBody {
    /// Encoded bytes, sent as they are.
    Bytes(Bytes),
    /// Fields of a `multipart/form-data` body. The transport encodes them and
    /// picks the boundary.
    Multipart(Vec<FormPart>),
}

/// One field of a multipart body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormPart {
    /// Form field name.
    pub name: String,
    pub data: Bytes,
    /// Set for file uploads.
    pub file_name: Option<String>,
    pub content_type: Option<String>,
}

impl FormPart {
    fn into_part(self) -> Result<(String, Part), reqwest::Error> {
        let mut part = Part::bytes(self.data.to_vec());
        if let Some(file_name) = self.file_name {
            part = part.file_name(file_name);
        }
        if let Some(content_type) = &self.content_type {
            part = part.mime_str(content_type)?;
        }
        Ok((self.name, part))
    }
}

fn form(parts: Vec<FormPart>) -> Result<Form, TransportError> {
    parts.into_iter().try_fold(Form::new(), |form, part| {
        let (name, part) = part
            .into_part()
            .map_err(|err| TransportError::Other(err.into()))?;
        Ok(form.part(name, part))
    })
}

/// Sends a single attempt of a request.
///
/// The dispatcher calls `send` once per attempt and handles timeouts, retries
/// and rate limits itself, so implementations should not retry on their own.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` and return the status, headers and full body.
    async fn send(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError>;
}

/// [`Transport`] backed by a [`reqwest_middleware`] client.
///
/// Any middleware stacked on the client runs for every attempt.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: ClientWithMiddleware,
}

impl ReqwestTransport {
    /// Create a transport around a default [`reqwest::Client`].
    #[must_use]
    pub fn new() -> Self {
        Self::from(reqwest::Client::new())
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl From<ClientWithMiddleware> for ReqwestTransport {
    fn from(client: ClientWithMiddleware) -> Self {
        Self { client }
    }
}

impl From<reqwest::Client> for ReqwestTransport {
    fn from(client: reqwest::Client) -> Self {
        Self::from(ClientWithMiddleware::from(client))
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: PreparedRequest) -> Result<ApiResponse, TransportError> {
        let builder = self
            .client
            .request(request.method, request.url)
            .headers(request.headers);
        // The form is rebuilt for every attempt since sending consumes it.
        let builder = match request.body {
            Some(PreparedBody::Bytes(body)) => builder.body(body),
            Some(PreparedBody::Multipart(parts)) => builder.multipart(form(parts)?),
            None => builder,
        };

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|err| TransportError::from(reqwest_middleware::Error::Reqwest(err)))?;

        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }
}
