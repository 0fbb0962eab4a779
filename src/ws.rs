//! WebSocket plumbing for the WebSocket transport.
//!
//! Wraps `tokio-tungstenite` into separately owned reader and writer halves
//! so the transport's receive loop and send loop can each hold one.
//!
//! ```text
//! connect(url, headers) ──> (WsWriter, WsReader)
//!                              │           │
//!                         send loop   receive loop
//! ```

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;

use crate::constants::{NORMAL_CLOSURE, NO_STATUS_RECEIVED};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Received WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send one binary frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    pub async fn send_binary(&mut self, data: &[u8]) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Binary(data.to_vec()))
            .await
            .context("WebSocket send_binary failed")
    }

    /// Send a normal-closure close frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn send_close(&mut self) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(NORMAL_CLOSURE),
            reason: "".into(),
        };
        self.sink
            .send(tungstenite::Message::Close(Some(frame)))
            .await
            .context("WebSocket send_close failed")
    }

    /// Flush pending writes and close the sink.
    ///
    /// # Errors
    ///
    /// Returns an error if closing fails.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, `None` once the stream ends.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };

            let message = match message {
                tungstenite::Message::Text(text) => WsMessage::Text(text.to_string()),
                tungstenite::Message::Binary(data) => WsMessage::Binary(data.to_vec()),
                tungstenite::Message::Ping(data) => WsMessage::Ping(data.to_vec()),
                tungstenite::Message::Pong(data) => WsMessage::Pong(data.to_vec()),
                tungstenite::Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|cf| (u16::from(cf.code), cf.reason.to_string()))
                        .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                    WsMessage::Close { code, reason }
                }
                tungstenite::Message::Frame(_) => continue,
            };
            return Some(Ok(message));
        }
    }
}

/// Open a WebSocket to `url`, adding each `(name, value)` header to the
/// handshake request.
///
/// # Errors
///
/// Returns an error if the URL or a header is invalid, or the handshake fails.
pub async fn connect(url: &str, headers: &[(String, String)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for (name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an `http(s)://` URL to `ws(s)://`. Other schemes pass through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme() {
        assert_eq!(http_to_ws_scheme("https://example.com/hub"), "wss://example.com/hub");
        assert_eq!(http_to_ws_scheme("http://localhost:5000/hub?id=1"), "ws://localhost:5000/hub?id=1");
        assert_eq!(http_to_ws_scheme("wss://example.com/hub"), "wss://example.com/hub");
    }

    #[test]
    fn test_scheme_only_rewritten_at_start() {
        assert_eq!(
            http_to_ws_scheme("http://a/?next=http://b"),
            "ws://a/?next=http://b"
        );
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        assert!(connect("not-a-url", &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_returns_error() {
        assert!(connect("ws://127.0.0.1:1/hub", &[]).await.is_err());
    }
}
