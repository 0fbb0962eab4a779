//! HTTP long-polling transport.
//!
//! The receive loop keeps one GET outstanding at a time. The server holds it
//! until it has data (200 with the framed payloads as body), the hold time
//! expires (200 with an empty body), or the connection is ending (204).
//! Sends are independent POSTs.
//!
//! ```text
//! ┌─────────┐  GET ?id=..   ┌────────┐
//! │  poll   │ ────────────> │ server │
//! │  loop   │ <──────────── │        │  200 body | 200 empty | 204 close
//! └─────────┘               └────────┘
//! ```
//!
//! Transient poll failures are retried with a growing backoff; after
//! `max_poll_retries` consecutive failures the transport fails.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{lock, LoopResult};
use super::{
    Endpoint, EventSink, Transport, TransportError, TransportEvent, TransportKind,
    TransportLifecycle, TransportOptions, TransportState,
};
use crate::constants::{POLL_RETRY_BACKOFF, POLL_TIMEOUT_SLACK};
use crate::http::HttpClient;

const LABEL: &str = "[LongPolling]";

/// Transport that receives through repeated long-held GET requests.
#[derive(Debug)]
pub struct LongPollingTransport {
    http: Arc<dyn HttpClient>,
    lifecycle: Arc<TransportLifecycle>,
    endpoint: Mutex<Option<Endpoint>>,
}

impl LongPollingTransport {
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
impl Transport for LongPollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::LongPolling
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

        reqwest::Url::parse(url).map_err(|e| TransportError::Fatal(format!("invalid URL '{url}': {e}")))?;

        let endpoint = Endpoint {
            url: url.to_string(),
            headers: options.headers.clone(),
        };
        *lock(&self.endpoint) = Some(endpoint.clone());

        let sink = self
            .lifecycle
            .event_sink()
            .ok_or(TransportError::ConnectionStopped)?;
        let poller = Poller {
            http: Arc::clone(&self.http),
            endpoint,
            request_timeout: options.poll_timeout + POLL_TIMEOUT_SLACK,
            max_retries: options.max_poll_retries,
        };

        let mut loops = JoinSet::new();
        loops.spawn(poller.run(sink, self.lifecycle.cancel_token()));

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

/// Outcome of one poll that does not end the loop.
enum PollStep {
    Continue,
    Failed(TransportError),
}

#[derive(Debug)]
struct Poller {
    http: Arc<dyn HttpClient>,
    endpoint: Endpoint,
    request_timeout: Duration,
    max_retries: u32,
}

impl Poller {
    async fn run(self, sink: EventSink, cancel: CancellationToken) -> LoopResult {
        log::debug!("{} Receive loop started.", LABEL);
        let mut failures = 0u32;

        let result = loop {
            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    log::debug!("{} Receive loop canceled.", LABEL);
                    break Ok(());
                }
                r = self.http.get(&self.endpoint.url, &self.endpoint.headers, self.request_timeout) => r,
            };

            let error = match self.handle(response, &sink).await {
                Ok(Some(PollStep::Continue)) => {
                    failures = 0;
                    continue;
                }
                Ok(Some(PollStep::Failed(e))) => e,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            failures += 1;
            log::warn!(
                "{} Error while polling '{}' ({}/{}): {}",
                LABEL,
                self.endpoint.url,
                failures,
                self.max_retries,
                error
            );
            if failures > self.max_retries {
                break Err(TransportError::Fatal(format!(
                    "polling failed {failures} times in a row: {error}"
                )));
            }

            let jitter = Duration::from_millis(rand::rng().random_range(0..250));
            let delay = POLL_RETRY_BACKOFF * failures + jitter;
            tokio::select! {
                () = cancel.cancelled() => break Ok(()),
                () = tokio::time::sleep(delay) => {}
            }
        };

        log::debug!("{} Receive loop stopped.", LABEL);
        result
    }

    /// Classify one poll response.
    ///
    /// `Ok(None)` ends the loop cleanly, `Err` ends it with an error.
    async fn handle(
        &self,
        response: Result<crate::http::HttpResponse, TransportError>,
        sink: &EventSink,
    ) -> Result<Option<PollStep>, TransportError> {
        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_transient() => return Ok(Some(PollStep::Failed(e))),
            Err(e) => return Err(e),
        };

        match response.status {
            204 => {
                log::info!("{} The server is closing the connection.", LABEL);
                Ok(None)
            }
            404 | 410 => Err(TransportError::Fatal(format!(
                "poll returned {}, the connection no longer exists",
                response.status
            ))),
            _ if response.is_success() => {
                if response.body.is_empty() {
                    log::trace!("{} Poll timed out, reissuing.", LABEL);
                    return Ok(Some(PollStep::Continue));
                }
                log::trace!("{} Message received. Size: {}", LABEL, response.body.len());
                if sink.received(response.body).await {
                    Ok(Some(PollStep::Continue))
                } else {
                    Ok(None)
                }
            }
            status => Ok(Some(PollStep::Failed(TransportError::Transient(format!(
                "unexpected response code {status}"
            ))))),
        }
    }
}
