//! Negotiation: ask the server for a connection id and its transports.
//!
//! ```text
//! POST {url}/negotiate
//! <- {"connectionId": "abc", "availableTransports": ["WebSockets", "LongPolling"]}
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use crate::http::HttpClient;
use crate::transport::TransportKind;

/// Server answer to a negotiate request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationResponse {
    /// Id the server assigned to this connection.
    pub connection_id: String,
    /// Transports the server accepts, in the server's order.
    pub available_transports: Vec<TransportKind>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawResponse {
    connection_id: String,
    #[serde(default)]
    available_transports: Vec<String>,
}

impl NegotiationResponse {
    /// Parse a negotiate response body. Transport names this client does not
    /// know are skipped.
    ///
    /// # Errors
    ///
    /// Fails on invalid JSON or an empty connection id.
    pub fn parse(body: &[u8]) -> Result<Self, String> {
        let raw: RawResponse =
            serde_json::from_slice(body).map_err(|e| format!("invalid negotiate response: {e}"))?;
        if raw.connection_id.is_empty() {
            return Err("negotiate response has an empty connectionId".to_string());
        }

        let available_transports = raw
            .available_transports
            .iter()
            .filter_map(|name| match name.parse::<TransportKind>() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    log::debug!("[Negotiate] Ignoring transport: {}", e);
                    None
                }
            })
            .collect();

        Ok(Self {
            connection_id: raw.connection_id,
            available_transports,
        })
    }
}

/// Negotiation collaborator used by `ClientConnection::start`.
#[async_trait]
pub trait Negotiator: Send + Sync + std::fmt::Debug {
    /// Negotiate with the hub at `url`.
    async fn negotiate(&self, url: &str) -> Result<NegotiationResponse, String>;
}

/// Negotiates over HTTP with `POST {url}/negotiate`.
#[derive(Debug, Clone)]
pub struct HttpNegotiator {
    http: Arc<dyn HttpClient>,
    headers: Vec<(String, String)>,
}

impl HttpNegotiator {
    /// Create a negotiator that sends its request through `http`.
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            http,
            headers: Vec::new(),
        }
    }

    /// Add headers to the negotiate request.
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }
}

/// `{url}/negotiate`, keeping any query string after the path.
pub(crate) fn negotiate_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|e| format!("invalid URL '{url}': {e}"))?;
    let path = format!("{}/negotiate", parsed.path().trim_end_matches('/'));
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

#[async_trait]
impl Negotiator for HttpNegotiator {
    async fn negotiate(&self, url: &str) -> Result<NegotiationResponse, String> {
        let negotiate_url = negotiate_url(url)?;
        log::debug!("[Negotiate] Establishing connection at: {}", negotiate_url);

        let response = self
            .http
            .post(&negotiate_url, &self.headers, Bytes::new())
            .await
            .map_err(|e| e.to_string())?;
        if !response.is_success() {
            return Err(format!("negotiate returned status {}", response.status));
        }

        NegotiationResponse::parse(&response.body)
    }
}
