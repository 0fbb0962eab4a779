//! Shared lifecycle state machine for transports.
//!
//! Each transport composes one [`TransportLifecycle`]. It owns the state,
//! the cancellation token the loops watch, and the event channel, and it
//! runs the supervisor task that turns loop results into the single
//! [`TransportEvent::Closed`] notification.
//!
//! # Shutdown
//!
//! ```text
//! stop(err) ─┐
//!            ├─> cancel ─> await loops (≤ grace) ─> abort stragglers ─> Stopped ─> Closed(err)
//! loop exit ─┘
//! ```
//!
//! Loop results are explicit `Result`s. A loop that panics is observed by the
//! supervisor and reported as `TransportError::Fatal`, never re-raised.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

use super::{EventSink, TransportError, TransportEvent, TransportState};

/// Result type of a transport loop task.
pub(crate) type LoopResult = Result<(), TransportError>;

/// State machine and supervisor shared by every transport implementation.
#[derive(Debug)]
pub struct TransportLifecycle {
    label: &'static str,
    state: Mutex<TransportState>,
    events: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    stop_error: Mutex<Option<TransportError>>,
    /// Terminating error, readable even if the closed event was dropped.
    close_error: Mutex<Option<TransportError>>,
    /// Cancelled to tell the loops to exit.
    cancel: CancellationToken,
    /// Cancelled once the transport reached `Stopped`.
    stopped: CancellationToken,
}

/// Guard for an in-progress `start`.
///
/// Dropping it without calling [`StartAttempt::run`] (error return, or the
/// start future being dropped on timeout) moves the transport to `Stopped`
/// without emitting any event.
#[derive(Debug)]
pub(crate) struct StartAttempt<'a> {
    lifecycle: &'a Arc<TransportLifecycle>,
    committed: bool,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Guarded sections never panic, so a poisoned lock still holds valid data.
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl TransportLifecycle {
    /// Create an unstarted lifecycle. `label` prefixes log lines.
    pub fn new(label: &'static str) -> Arc<Self> {
        Arc::new(Self {
            label,
            state: Mutex::new(TransportState::Unstarted),
            events: Mutex::new(None),
            stop_error: Mutex::new(None),
            close_error: Mutex::new(None),
            cancel: CancellationToken::new(),
            stopped: CancellationToken::new(),
        })
    }

    /// Current state.
    pub fn state(&self) -> TransportState {
        *lock(&self.state)
    }

    /// Error the transport stopped with, once `Stopped`.
    pub fn close_error(&self) -> Option<TransportError> {
        lock(&self.close_error).clone()
    }

    /// Token cancelled when the loops must exit.
    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Check that `send` may hand a payload to the transport.
    pub(crate) fn ensure_sendable(&self) -> Result<(), TransportError> {
        match self.state() {
            TransportState::Unstarted | TransportState::Starting => Err(TransportError::NotConnected),
            TransportState::Connected if !self.cancel.is_cancelled() => Ok(()),
            _ => Err(TransportError::ConnectionStopped),
        }
    }

    /// Sink for the receive loop, `None` if the transport never started.
    pub(crate) fn event_sink(&self) -> Option<EventSink> {
        lock(&self.events).as_ref().map(|tx| EventSink {
            label: self.label,
            tx: tx.clone(),
            cancel: self.cancel.clone(),
        })
    }

    /// Move `Unstarted -> Starting` and keep the event channel.
    pub(crate) fn begin_start<'a>(
        self: &'a Arc<Self>,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<StartAttempt<'a>, TransportError> {
        {
            let mut state = lock(&self.state);
            if *state != TransportState::Unstarted {
                return Err(TransportError::AlreadyStarted);
            }
            *state = TransportState::Starting;
        }
        *lock(&self.events) = Some(events);
        log::info!("{} Starting transport.", self.label);

        Ok(StartAttempt {
            lifecycle: self,
            committed: false,
        })
    }

    /// Ensure `Connected` is only entered from `Starting`.
    fn mark_connected(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == TransportState::Starting {
            *state = TransportState::Connected;
            true
        } else {
            false
        }
    }

    fn set_state(&self, next: TransportState) {
        let mut state = lock(&self.state);
        if next > *state {
            *state = next;
        }
    }

    fn abort_start(&self) {
        self.set_state(TransportState::Stopped);
        lock(&self.events).take();
        self.cancel.cancel();
        self.stopped.cancel();
        log::debug!("{} Transport stopped before connecting.", self.label);
    }

    /// Request shutdown and wait until the transport is `Stopped`.
    pub async fn stop(&self, error: Option<TransportError>) {
        {
            let mut state = lock(&self.state);
            if *state == TransportState::Unstarted {
                *state = TransportState::Stopped;
                self.cancel.cancel();
                self.stopped.cancel();
                return;
            }
        }

        if let Some(error) = error {
            lock(&self.stop_error).get_or_insert(error);
        }
        self.cancel.cancel();
        self.stopped.cancelled().await;
    }

    async fn supervise(self: Arc<Self>, mut loops: JoinSet<LoopResult>, grace: Duration) {
        let mut error = None;

        tokio::select! {
            () = self.cancel.cancelled() => {}
            Some(res) = loops.join_next() => error = loop_error(self.label, res),
        }

        self.set_state(TransportState::Stopping);
        log::info!("{} Transport is stopping.", self.label);
        self.cancel.cancel();

        let drain = async {
            while let Some(res) = loops.join_next().await {
                if let Some(e) = loop_error(self.label, res) {
                    error.get_or_insert(e);
                }
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            log::warn!(
                "{} Loops did not exit within {:?}, aborting them.",
                self.label,
                grace
            );
            loops.abort_all();
            while loops.join_next().await.is_some() {}
        }

        let requested = lock(&self.stop_error).take();
        let error = requested.or(error);

        *lock(&self.close_error) = error.clone();
        self.set_state(TransportState::Stopped);
        match &error {
            Some(e) => log::info!("{} Transport stopped: {}", self.label, e),
            None => log::debug!("{} Transport stopped.", self.label),
        }

        let events = lock(&self.events).take();
        if let Some(tx) = events {
            let closed = tx.send(TransportEvent::Closed(error));
            match tokio::time::timeout(grace, closed).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => log::debug!("{} Closed event dropped, receiver gone.", self.label),
                Err(_) => log::warn!(
                    "{} Timed out delivering closed event, dropping it.",
                    self.label
                ),
            }
        }

        self.stopped.cancel();
    }
}

impl StartAttempt<'_> {
    /// Commit the start: enter `Connected` and supervise `loops`.
    ///
    /// If stop was requested while starting, the supervisor shuts the loops
    /// straight down and reports `Closed`.
    pub(crate) fn run(mut self, loops: JoinSet<LoopResult>, grace: Duration) {
        self.committed = true;
        let lifecycle = Arc::clone(self.lifecycle);
        if lifecycle.mark_connected() {
            log::info!("{} Transport connected.", lifecycle.label);
        }
        tokio::spawn(lifecycle.supervise(loops, grace));
    }
}

impl Drop for StartAttempt<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.lifecycle.abort_start();
        }
    }
}

/// Reduce a joined loop to the error it reports, if any.
fn loop_error(label: &str, res: Result<LoopResult, JoinError>) -> Option<TransportError> {
    match res {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) if e.is_cancelled() => None,
        Err(e) => {
            log::error!("{} Transport loop faulted: {}", label, e);
            Some(TransportError::Fatal(format!("transport loop faulted: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::Sender<TransportEvent>, mpsc::Receiver<TransportEvent>) {
        mpsc::channel(8)
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let lifecycle = TransportLifecycle::new("[Test]");
        let (tx, _rx) = channel();

        let attempt = lifecycle.begin_start(tx.clone()).unwrap();
        assert_eq!(lifecycle.state(), TransportState::Starting);
        assert_eq!(
            lifecycle.begin_start(tx).unwrap_err(),
            TransportError::AlreadyStarted
        );

        attempt.run(JoinSet::new(), Duration::from_secs(1));
        lifecycle.stop(None).await;
    }

    #[tokio::test]
    async fn test_dropped_attempt_stops_without_events() {
        let lifecycle = TransportLifecycle::new("[Test]");
        let (tx, mut rx) = channel();

        drop(lifecycle.begin_start(tx).unwrap());
        assert_eq!(lifecycle.state(), TransportState::Stopped);
        assert!(rx.recv().await.is_none());

        // stop after a failed start returns immediately
        lifecycle.stop(None).await;
    }

    #[tokio::test]
    async fn test_stop_reports_requested_error_once() {
        let lifecycle = TransportLifecycle::new("[Test]");
        let (tx, mut rx) = channel();

        let cancel = lifecycle.cancel_token();
        let mut loops = JoinSet::new();
        loops.spawn(async move {
            cancel.cancelled().await;
            Ok(())
        });
        lifecycle.begin_start(tx).unwrap().run(loops, Duration::from_secs(1));
        assert_eq!(lifecycle.state(), TransportState::Connected);

        lifecycle.stop(Some(TransportError::Timeout)).await;
        lifecycle.stop(Some(TransportError::Fatal("later".into()))).await;

        assert_eq!(lifecycle.state(), TransportState::Stopped);
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Closed(Some(TransportError::Timeout)))
        );
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_loop_error_ends_transport() {
        let lifecycle = TransportLifecycle::new("[Test]");
        let (tx, mut rx) = channel();

        let mut loops = JoinSet::new();
        loops.spawn(async { Err(TransportError::Fatal("socket reset".into())) });
        lifecycle.begin_start(tx).unwrap().run(loops, Duration::from_secs(1));

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Closed(Some(TransportError::Fatal(
                "socket reset".into()
            ))))
        );
        assert_eq!(lifecycle.state(), TransportState::Stopped);
    }

    #[tokio::test]
    async fn test_panicking_loop_is_reported_not_propagated() {
        let lifecycle = TransportLifecycle::new("[Test]");
        let (tx, mut rx) = channel();

        let mut loops: JoinSet<LoopResult> = JoinSet::new();
        loops.spawn(async { panic!("receive loop bug") });
        lifecycle.begin_start(tx).unwrap().run(loops, Duration::from_secs(1));

        match rx.recv().await {
            Some(TransportEvent::Closed(Some(TransportError::Fatal(msg)))) => {
                assert!(msg.contains("faulted"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stuck_loop_is_aborted_after_grace() {
        let lifecycle = TransportLifecycle::new("[Test]");
        let (tx, mut rx) = channel();

        let mut loops = JoinSet::new();
        loops.spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        lifecycle
            .begin_start(tx)
            .unwrap()
            .run(loops, Duration::from_millis(50));

        lifecycle.stop(None).await;
        assert_eq!(rx.recv().await, Some(TransportEvent::Closed(None)));
    }

    #[tokio::test]
    async fn test_close_error_survives_undeliverable_closed_event() {
        let lifecycle = TransportLifecycle::new("[Test]");
        let (tx, mut rx) = mpsc::channel(1);
        tx.try_send(TransportEvent::Received(bytes::Bytes::from_static(b"\x01")))
            .unwrap();

        let mut loops = JoinSet::new();
        loops.spawn(async { Err(TransportError::Fatal("socket reset".into())) });
        lifecycle
            .begin_start(tx)
            .unwrap()
            .run(loops, Duration::from_millis(50));

        // Nobody reads the full queue, so the supervisor gives up on Closed.
        lifecycle.stopped.cancelled().await;
        assert_eq!(lifecycle.state(), TransportState::Stopped);
        assert_eq!(
            lifecycle.close_error(),
            Some(TransportError::Fatal("socket reset".into()))
        );

        assert!(matches!(rx.recv().await, Some(TransportEvent::Received(_))));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_clean_stop_has_no_close_error() {
        let lifecycle = TransportLifecycle::new("[Test]");
        let (tx, _rx) = channel();
        lifecycle
            .begin_start(tx)
            .unwrap()
            .run(JoinSet::new(), Duration::from_secs(1));
        assert_eq!(lifecycle.close_error(), None);

        lifecycle.stop(None).await;
        assert_eq!(lifecycle.close_error(), None);
    }

    #[tokio::test]
    async fn test_sendable_only_while_connected() {
        let lifecycle = TransportLifecycle::new("[Test]");
        assert_eq!(lifecycle.ensure_sendable(), Err(TransportError::NotConnected));

        let (tx, _rx) = channel();
        let attempt = lifecycle.begin_start(tx).unwrap();
        assert_eq!(lifecycle.ensure_sendable(), Err(TransportError::NotConnected));

        let cancel = lifecycle.cancel_token();
        let mut loops = JoinSet::new();
        loops.spawn(async move {
            cancel.cancelled().await;
            Ok(())
        });
        attempt.run(loops, Duration::from_secs(1));
        assert_eq!(lifecycle.ensure_sendable(), Ok(()));

        lifecycle.stop(None).await;
        assert_eq!(lifecycle.ensure_sendable(), Err(TransportError::ConnectionStopped));
    }

    #[tokio::test]
    async fn test_stop_before_start() {
        let lifecycle = TransportLifecycle::new("[Test]");
        lifecycle.stop(None).await;
        assert_eq!(lifecycle.state(), TransportState::Stopped);

        let (tx, _rx) = channel();
        assert!(lifecycle.begin_start(tx).is_err());
    }
}
