//! WebSocket transport.
//!
//! ```text
//! send(payload) ──> outgoing queue ──> send loop ──> WsWriter ──> server
//! server ──> WsReader ──> receive loop ──> TransportEvent::Received
//! ```
//!
//! Each WebSocket message is one payload, so no framing is added at this
//! layer. A server close frame ends the receive loop; a normal closure is a
//! clean stop, any other code is reported as `TransportError::ClosedByServer`.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{lock, LoopResult};
use super::{
    EventSink, Transport, TransportError, TransportEvent, TransportKind, TransportLifecycle,
    TransportOptions, TransportState,
};
use crate::constants::{NORMAL_CLOSURE, NO_STATUS_RECEIVED};
use crate::ws::{self, WsMessage, WsReader, WsWriter};

const LABEL: &str = "[WebSocket]";

/// Full-duplex transport over a single WebSocket.
#[derive(Debug)]
pub struct WebSocketTransport {
    lifecycle: Arc<TransportLifecycle>,
    outgoing: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl WebSocketTransport {
    /// Create an unstarted transport.
    pub fn new() -> Self {
        Self {
            lifecycle: TransportLifecycle::new(LABEL),
            outgoing: Mutex::new(None),
        }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSockets
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

        let url = ws::http_to_ws_scheme(url);
        log::info!("{} Starting transport. Url: {}", LABEL, url);

        let (writer, reader) = ws::connect(&url, &options.headers)
            .await
            .map_err(|e| TransportError::Fatal(format!("{e:#}")))?;

        let sink = self
            .lifecycle
            .event_sink()
            .ok_or(TransportError::ConnectionStopped)?;
        let (tx, rx) = mpsc::channel(options.send_queue_capacity.max(1));
        *lock(&self.outgoing) = Some(tx);

        let cancel = self.lifecycle.cancel_token();
        let mut loops = JoinSet::new();
        loops.spawn(receive_loop(reader, sink, cancel.clone()));
        loops.spawn(send_loop(writer, rx, cancel));

        attempt.run(loops, options.shutdown_grace);
        Ok(())
    }

    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.lifecycle.ensure_sendable()?;
        let tx = lock(&self.outgoing)
            .clone()
            .ok_or(TransportError::NotConnected)?;

        if tx.send(payload).await.is_err() {
            return Err(TransportError::ConnectionStopped);
        }
        Ok(())
    }

    async fn stop(&self, error: Option<TransportError>) {
        lock(&self.outgoing).take();
        self.lifecycle.stop(error).await;
    }
}

async fn receive_loop(mut reader: WsReader, sink: EventSink, cancel: CancellationToken) -> LoopResult {
    log::debug!("{} Receive loop started.", LABEL);

    let result = loop {
        let message = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                log::debug!("{} Receive loop canceled.", LABEL);
                break Ok(());
            }
            message = reader.recv() => message,
        };

        let payload = match message {
            Some(Ok(WsMessage::Binary(data))) => Bytes::from(data),
            Some(Ok(WsMessage::Text(text))) => Bytes::from(text.into_bytes()),
            // tungstenite answers pings itself
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
            Some(Ok(WsMessage::Close { code, reason })) => {
                log::info!(
                    "{} WebSocket closed by the server. Close status: {} {}",
                    LABEL,
                    code,
                    reason
                );
                if code == NORMAL_CLOSURE || code == NO_STATUS_RECEIVED {
                    break Ok(());
                }
                break Err(TransportError::ClosedByServer { code, reason });
            }
            Some(Err(e)) => break Err(TransportError::Fatal(format!("{e:#}"))),
            None => {
                break Err(TransportError::Fatal(
                    "WebSocket stream ended without a close frame".to_string(),
                ))
            }
        };

        log::trace!("{} Message received. Size: {}", LABEL, payload.len());
        if !sink.received(payload).await {
            break Ok(());
        }
    };

    log::debug!("{} Receive loop stopped.", LABEL);
    result
}

async fn send_loop(mut writer: WsWriter, mut rx: mpsc::Receiver<Bytes>, cancel: CancellationToken) -> LoopResult {
    log::debug!("{} Send loop started.", LABEL);

    let result = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                log::debug!("{} Send loop canceled.", LABEL);
                break Ok(());
            }
            next = rx.recv() => {
                let Some(payload) = next else { break Ok(()) };
                if let Err(e) = writer.send_binary(&payload).await {
                    break Err(TransportError::Fatal(format!("{e:#}")));
                }
            }
        }
    };

    // Payloads accepted before stop still go out ahead of the close frame.
    rx.close();
    if result.is_ok() {
        while let Ok(payload) = rx.try_recv() {
            if let Err(e) = writer.send_binary(&payload).await {
                log::debug!("{} Dropping queued payloads: {:#}", LABEL, e);
                break;
            }
        }
    }

    if let Err(e) = writer.send_close().await {
        log::debug!("{} Close frame not sent: {:#}", LABEL, e);
    }
    if let Err(e) = writer.close().await {
        log::debug!("{} Socket close failed: {:#}", LABEL, e);
    }

    log::debug!("{} Send loop stopped.", LABEL);
    result
}
