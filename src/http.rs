//! HTTP client abstraction for the HTTP-based transports and negotiation.
//!
//! Long polling, Server-Sent Events and the negotiate request only need three
//! operations, so they go through the narrow [`HttpClient`] trait instead of
//! `reqwest` directly. Tests substitute their own implementation.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::constants::MAX_RESPONSE_BODY_SIZE;
use crate::transport::TransportError;

/// Body chunks of a streaming response.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// A minimal HTTP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Bytes,
}

impl HttpResponse {
    /// True for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Async HTTP operations used by the transports.
///
/// Request-level failures (connect refused, timeout, reset) are returned as
/// `TransportError::Transient` or `TransportError::Timeout`; a response with
/// any status is `Ok`.
#[async_trait]
pub trait HttpClient: Send + Sync + std::fmt::Debug {
    /// GET `url`, giving up after `timeout`.
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError>;

    /// POST `body` as `application/octet-stream`.
    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<HttpResponse, TransportError>;

    /// GET `url` as an event stream and return the body as it arrives.
    ///
    /// A non-2xx status is returned as `TransportError::Fatal`.
    async fn open_stream(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<ByteStream, TransportError>;
}

/// [`HttpClient`] backed by a shared `reqwest::Client`.
///
/// Response bodies larger than the configured limit are rejected with
/// `TransportError::Fatal` instead of being buffered.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    inner: reqwest::Client,
    max_body_size: usize,
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::from_client(reqwest::Client::default())
    }
}

impl ReqwestHttpClient {
    /// Create a client with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap an existing `reqwest::Client`.
    pub fn from_client(inner: reqwest::Client) -> Self {
        Self {
            inner,
            max_body_size: MAX_RESPONSE_BODY_SIZE,
        }
    }

    /// Reject response bodies longer than `limit` bytes.
    pub fn with_max_body_size(mut self, limit: usize) -> Self {
        self.max_body_size = limit;
        self
    }

    async fn read(&self, request: reqwest::RequestBuilder) -> Result<HttpResponse, TransportError> {
        let mut response = request.send().await.map_err(classify)?;
        let status = response.status().as_u16();

        let declared = response.content_length().unwrap_or(0);
        if declared > self.max_body_size as u64 {
            return Err(self.body_too_large());
        }

        let mut body = BytesMut::with_capacity(declared as usize);
        while let Some(chunk) = response.chunk().await.map_err(classify)? {
            if body.len() + chunk.len() > self.max_body_size {
                return Err(self.body_too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(HttpResponse {
            status,
            body: body.freeze(),
        })
    }

    fn body_too_large(&self) -> TransportError {
        log::warn!(
            "[HttpClient] Response body exceeds {} bytes, discarding it.",
            self.max_body_size
        );
        TransportError::Fatal(format!(
            "response body exceeds {} bytes",
            self.max_body_size
        ))
    }
}

fn with_headers(
    mut request: reqwest::RequestBuilder,
    headers: &[(String, String)],
) -> reqwest::RequestBuilder {
    for (name, value) in headers {
        request = request.header(name.as_str(), value.as_str());
    }
    request
}

/// Map a reqwest failure onto the transport error taxonomy.
fn classify(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_builder() {
        TransportError::Fatal(format!("invalid request: {e}"))
    } else {
        TransportError::Transient(e.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, TransportError> {
        let request = with_headers(self.inner.get(url), headers).timeout(timeout);
        self.read(request).await
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: Bytes,
    ) -> Result<HttpResponse, TransportError> {
        let request = with_headers(self.inner.post(url), headers)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        self.read(request).await
    }

    async fn open_stream(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> Result<ByteStream, TransportError> {
        let request = with_headers(self.inner.get(url), headers)
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = request.send().await.map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Fatal(format!(
                "event stream request returned {}",
                status.as_u16()
            )));
        }

        Ok(response.bytes_stream().map(|chunk| chunk.map_err(classify)).boxed())
    }
}
