//! Server-Sent Events transport.
//!
//! Receives over one long-lived `text/event-stream` response and sends with
//! independent POSTs. Each event's `data:` lines carry base64 text of framed
//! binary bytes. A frame may be split across events, so decoded bytes go
//! through a [`FrameDecoder`] and only complete frames are delivered.
//!
//! ```text
//! event stream ──> SseParser ──> base64 ──> FrameDecoder ──> TransportEvent::Received
//! ```
//!
//! The server ending the stream is a clean close.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{lock, LoopResult};
use super::{
    Endpoint, EventSink, Transport, TransportError, TransportEvent, TransportKind,
    TransportLifecycle, TransportOptions, TransportState,
};
use crate::framing::{BinaryFramer, FrameDecoder};
use crate::http::{ByteStream, HttpClient};

const LABEL: &str = "[ServerSentEvents]";

/// Transport that receives through a server push stream.
#[derive(Debug)]
pub struct ServerSentEventsTransport {
    http: Arc<dyn HttpClient>,
    lifecycle: Arc<TransportLifecycle>,
    endpoint: Mutex<Option<Endpoint>>,
}

impl ServerSentEventsTransport {
    /// Create an unstarted transport that issues requests through `http`.
    pub fn new(http: Arc<dyn HttpClient>) -> Self {
        Self {
            http,
            lifecycle: TransportLifecycle::new(LABEL),
            endpoint: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for ServerSentEventsTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::ServerSentEvents
    }

    fn state(&self) -> TransportState {
        self.lifecycle.state()
    }

    fn close_error(&self) -> Option<TransportError> {
        self.lifecycle.close_error()
    }

    async fn start(
        &self,
        url: &str,
        options: &TransportOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<(), TransportError> {
        let attempt = self.lifecycle.begin_start(events)?;
        log::info!("{} Starting transport. Url: {}", LABEL, url);

        let stream = self.http.open_stream(url, &options.headers).await?;
        *lock(&self.endpoint) = Some(Endpoint {
            url: url.to_string(),
            headers: options.headers.clone(),
        });

        let sink = self
            .lifecycle
            .event_sink()
            .ok_or(TransportError::ConnectionStopped)?;
        let decoder = FrameDecoder::new(BinaryFramer::new(options.max_message_size));

        let mut loops = JoinSet::new();
        loops.spawn(receive_loop(stream, decoder, sink, self.lifecycle.cancel_token()));

        attempt.run(loops, options.shutdown_grace);
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.lifecycle.ensure_sendable()?;
        let endpoint = lock(&self.endpoint)
            .clone()
            .ok_or(TransportError::NotConnected)?;
        endpoint.post(self.http.as_ref(), LABEL, payload).await
    }

    async fn stop(&self, error: Option<TransportError>) {
        self.lifecycle.stop(error).await;
    }
}

async fn receive_loop(
    mut stream: ByteStream,
    mut decoder: FrameDecoder,
    sink: EventSink,
    cancel: CancellationToken,
) -> LoopResult {
    log::debug!("{} Receive loop started.", LABEL);
    let mut parser = SseParser::default();

    let result = 'outer: loop {
        let chunk = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                log::debug!("{} Receive loop canceled.", LABEL);
                break Ok(());
            }
            chunk = stream.next() => chunk,
        };

        let chunk = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => break Err(TransportError::Fatal(format!("event stream failed: {e}"))),
            None => {
                log::info!("{} Server-Sent Event Stream ended.", LABEL);
                if decoder.has_partial() {
                    log::warn!("{} Stream ended inside a frame, discarding partial data.", LABEL);
                }
                break Ok(());
            }
        };

        for data in parser.push(&chunk) {
            match decode_event(&mut decoder, &data) {
                Ok(Some(frames)) => {
                    log::trace!("{} Message received. Size: {}", LABEL, frames.len());
                    if !sink.received(frames).await {
                        break 'outer Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => break 'outer Err(e),
            }
        }
    };

    log::debug!("{} Receive loop stopped.", LABEL);
    result
}

/// Base64-decode one event and return any frames it completes.
fn decode_event(decoder: &mut FrameDecoder, data: &str) -> Result<Option<Bytes>, TransportError> {
    let bytes = BASE64
        .decode(data.trim())
        .map_err(|e| TransportError::Fatal(format!("event data is not base64: {e}")))?;
    decoder
        .feed(&bytes)
        .map_err(|e| TransportError::Fatal(format!("invalid frame in event stream: {e}")))
}

/// Incremental `text/event-stream` parser.
///
/// Only `data` fields are kept. Multiple `data` lines of one event are
/// concatenated; a blank line dispatches the event.
#[derive(Debug, Default)]
struct SseParser {
    line: Vec<u8>,
    data: String,
    has_data: bool,
}

impl SseParser {
    /// Feed raw stream bytes, returning the data of every completed event.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut events = Vec::new();

        for &byte in chunk {
            if byte != b'\n' {
                self.line.push(byte);
                continue;
            }

            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            let line = std::mem::take(&mut self.line);
            self.process_line(&line, &mut events);
        }

        events
    }

    fn process_line(&mut self, line: &[u8], events: &mut Vec<String>) {
        if line.is_empty() {
            if self.has_data {
                events.push(std::mem::take(&mut self.data));
                self.has_data = false;
            }
            return;
        }
        if line[0] == b':' {
            return; // comment / keep-alive
        }

        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (&*line, ""),
        };

        if field == "data" {
            self.data.push_str(value);
            self.has_data = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parser_splits_events() {
        let mut parser = SseParser::default();
        let events = parser.push(b"data: AQ==\n\ndata: Ag==\n\n");
        assert_eq!(events, vec!["AQ==".to_string(), "Ag==".to_string()]);
    }

    #[test]
    fn test_parser_handles_crlf_comments_and_other_fields() {
        let mut parser = SseParser::default();
        let events = parser.push(b": keep-alive\r\nevent: message\r\nid: 4\r\ndata: AQ==\r\n\r\n");
        assert_eq!(events, vec!["AQ==".to_string()]);
    }

    #[test]
    fn test_parser_concatenates_multi_line_data() {
        let mut parser = SseParser::default();
        let events = parser.push(b"data: AQID\ndata: BA==\n\n");
        assert_eq!(events, vec!["AQIDBA==".to_string()]);
    }

    #[test]
    fn test_parser_event_split_across_chunks() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"da").is_empty());
        assert!(parser.push(b"ta: AQ").is_empty());
        assert!(parser.push(b"==\n").is_empty());
        assert_eq!(parser.push(b"\n"), vec!["AQ==".to_string()]);
    }

    #[test]
    fn test_blank_lines_without_data_dispatch_nothing() {
        let mut parser = SseParser::default();
        assert!(parser.push(b"\n\n: ping\n\n").is_empty());
    }

    #[test]
    fn test_frame_split_across_events_is_reassembled() {
        let framed = BinaryFramer::default().write(b"hello");
        let (head, tail) = framed.split_at(3);

        let mut decoder = FrameDecoder::default();
        assert_eq!(decode_event(&mut decoder, &BASE64.encode(head)).unwrap(), None);
        let frames = decode_event(&mut decoder, &BASE64.encode(tail)).unwrap().unwrap();
        assert_eq!(frames.as_ref(), &framed[..]);
    }

    #[test]
    fn test_invalid_base64_is_fatal() {
        let mut decoder = FrameDecoder::default();
        let err = decode_event(&mut decoder, "***").unwrap_err();
        assert!(matches!(err, TransportError::Fatal(_)));
    }
}
