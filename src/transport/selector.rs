//! Ordered transport fallback.
//!
//! Candidates are started one at a time in the caller's preference order.
//! The first one that starts wins; later candidates are never started.
//!
//! ```text
//! [WebSockets] ──fail──> [ServerSentEvents] ──fail──> [LongPolling] ──fail──> NegotiationError
//!      │ ok                      │ ok                        │ ok
//!      └────────────────────────┴──────────────────────────┴──> selected transport
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use super::{Transport, TransportError, TransportEvent, TransportKind, TransportOptions};
use crate::constants::TRANSPORT_START_TIMEOUT;

/// Every candidate failed to start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationError {
    /// Each candidate tried, in order, with the reason it failed.
    pub attempted: Vec<(TransportKind, TransportError)>,
}

impl std::fmt::Display for NegotiationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.attempted.is_empty() {
            return write!(f, "No transports available");
        }
        write!(f, "Unable to connect with any transport")?;
        for (kind, error) in &self.attempted {
            write!(f, "; {kind}: {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for NegotiationError {}

/// Starts the first viable transport from an ordered candidate list.
#[derive(Debug, Clone, Copy)]
pub struct TransportSelector {
    start_timeout: Duration,
}

impl TransportSelector {
    /// Create a selector that bounds each candidate's start by `start_timeout`.
    pub fn new(start_timeout: Duration) -> Self {
        Self { start_timeout }
    }

    /// Start candidates in order until one succeeds.
    ///
    /// A candidate that errors or exceeds the start timeout is recorded and
    /// the next one is tried. Failed candidates are `Stopped` and emit no
    /// events.
    ///
    /// # Errors
    ///
    /// Returns [`NegotiationError`] listing every attempt when none started.
    pub async fn connect(
        &self,
        url: &str,
        candidates: Vec<Arc<dyn Transport>>,
        options: &TransportOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn Transport>, NegotiationError> {
        let mut attempted = Vec::with_capacity(candidates.len());

        for transport in candidates {
            let kind = transport.kind();
            log::info!("[TransportSelector] Starting transport '{}'.", kind);

            let start = transport.start(url, options, events.clone());
            let outcome = tokio::time::timeout(self.start_timeout, start).await;
            let error = match outcome {
                Ok(Ok(())) => {
                    log::info!("[TransportSelector] Selected transport '{}'.", kind);
                    return Ok(transport);
                }
                Ok(Err(e)) => e,
                Err(_elapsed) => {
                    transport.stop(Some(TransportError::Timeout)).await;
                    TransportError::Timeout
                }
            };

            log::warn!(
                "[TransportSelector] Failed to start connection. Error starting transport '{}': {}",
                kind,
                error
            );
            attempted.push((kind, error));
        }

        Err(NegotiationError { attempted })
    }
}

impl Default for TransportSelector {
    fn default() -> Self {
        Self::new(TRANSPORT_START_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportState;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy)]
    enum Behavior {
        Fail,
        Hang,
        Succeed,
    }

    #[derive(Debug)]
    struct FakeTransport {
        kind: TransportKind,
        behavior: Behavior,
        starts: AtomicUsize,
    }

    impl FakeTransport {
        fn new(kind: TransportKind, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                kind,
                behavior,
                starts: AtomicUsize::new(0),
            })
        }

        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn kind(&self) -> TransportKind {
            self.kind
        }

        fn state(&self) -> TransportState {
            TransportState::Unstarted
        }

        async fn start(
            &self,
            _url: &str,
            _options: &TransportOptions,
            _events: mpsc::Sender<TransportEvent>,
        ) -> Result<(), TransportError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Fail => Err(TransportError::Fatal("refused".into())),
                Behavior::Hang => std::future::pending().await,
                Behavior::Succeed => Ok(()),
            }
        }

        async fn send(&self, _payload: Bytes) -> Result<(), TransportError> {
            Ok(())
        }

        async fn stop(&self, _error: Option<TransportError>) {}
    }

    #[tokio::test]
    async fn test_first_success_wins_and_later_candidates_untouched() {
        let a = FakeTransport::new(TransportKind::WebSockets, Behavior::Fail);
        let b = FakeTransport::new(TransportKind::ServerSentEvents, Behavior::Succeed);
        let c = FakeTransport::new(TransportKind::LongPolling, Behavior::Succeed);
        let (tx, _rx) = mpsc::channel(1);

        let candidates: Vec<Arc<dyn Transport>> = vec![
            Arc::clone(&a) as Arc<dyn Transport>,
            Arc::clone(&b) as Arc<dyn Transport>,
            Arc::clone(&c) as Arc<dyn Transport>,
        ];
        let selected = TransportSelector::default()
            .connect("http://hub.test", candidates, &TransportOptions::default(), tx)
            .await
            .unwrap();

        assert_eq!(selected.kind(), TransportKind::ServerSentEvents);
        assert_eq!(a.starts(), 1);
        assert_eq!(b.starts(), 1);
        assert_eq!(c.starts(), 0);
    }

    #[tokio::test]
    async fn test_all_failures_are_reported_in_order() {
        let a = FakeTransport::new(TransportKind::WebSockets, Behavior::Fail);
        let b = FakeTransport::new(TransportKind::LongPolling, Behavior::Hang);
        let (tx, _rx) = mpsc::channel(1);

        let candidates: Vec<Arc<dyn Transport>> =
            vec![a as Arc<dyn Transport>, b as Arc<dyn Transport>];
        let err = TransportSelector::new(Duration::from_millis(50))
            .connect("http://hub.test", candidates, &TransportOptions::default(), tx)
            .await
            .unwrap_err();

        assert_eq!(
            err.attempted,
            vec![
                (TransportKind::WebSockets, TransportError::Fatal("refused".into())),
                (TransportKind::LongPolling, TransportError::Timeout),
            ]
        );
        assert!(err.to_string().contains("LongPolling: Operation timed out"));
    }

    #[tokio::test]
    async fn test_no_candidates() {
        let (tx, _rx) = mpsc::channel(1);
        let err = TransportSelector::default()
            .connect("http://hub.test", Vec::new(), &TransportOptions::default(), tx)
            .await
            .unwrap_err();
        assert!(err.attempted.is_empty());
        assert_eq!(err.to_string(), "No transports available");
    }
}
