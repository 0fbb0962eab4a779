//! Server-side connection registry.
//!
//! [`ConnectionManager`] maps connection ids to the transport serving them
//! and the last time anything arrived on it. A periodic scan evicts
//! connections that went silent.
//!
//! ```text
//!                 register ──> { id -> ConnectionRecord { transport, last_activity } }
//!  inbound frame ─ touch ────────────────────────────┘        │
//!  transport closed ─ remove ─────────────────────────────────┤
//!  scanner tick ─ scan(now, timeout) ─ stale? ─ remove + stop(Timeout)
//! ```
//!
//! Every registry operation takes the lock once and never awaits while
//! holding it. Evicted transports are stopped after the lock is released,
//! each in its own task with its own timeout, so one stuck or failing
//! transport never blocks the scan of the others.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, SystemClock};
use crate::config::ServerConfig;
use crate::constants::RECEIVE_QUEUE_CAPACITY;
use crate::transport::lifecycle::lock;
use crate::transport::{Transport, TransportError, TransportEvent, TransportKind, TransportState};

#[derive(Debug)]
struct ConnectionRecord {
    transport: Arc<dyn Transport>,
    last_activity: Instant,
}

/// Snapshot of one registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Connection id.
    pub id: String,
    /// Transport kind serving the connection.
    pub kind: TransportKind,
    /// Last time the connection showed activity.
    pub last_activity: Instant,
    /// Current transport state.
    pub state: TransportState,
}

/// Registry of live server-side connections.
#[derive(Debug)]
pub struct ConnectionManager {
    records: Mutex<HashMap<String, ConnectionRecord>>,
    clock: Arc<dyn Clock>,
    inactivity_timeout: Duration,
    scan_interval: Duration,
    dispose_timeout: Duration,
}

impl ConnectionManager {
    /// Create a manager using the system clock.
    pub fn new(config: &ServerConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a manager reading time from `clock`.
    pub fn with_clock(config: &ServerConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(HashMap::new()),
            clock,
            inactivity_timeout: config.inactivity_timeout(),
            scan_interval: config.scan_interval(),
            dispose_timeout: config.dispose_timeout(),
        })
    }

    /// Add `transport` under a fresh id with activity set to now.
    pub fn register(&self, transport: Arc<dyn Transport>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let record = ConnectionRecord {
            transport,
            last_activity: self.clock.now(),
        };
        lock(&self.records).insert(id.clone(), record);
        log::debug!("[ConnectionManager] New connection {} created.", id);
        id
    }

    /// Mark activity on `id`. Returns false if the id is unknown.
    pub fn touch(&self, id: &str) -> bool {
        let now = self.clock.now();
        match lock(&self.records).get_mut(id) {
            Some(record) => {
                record.last_activity = now;
                true
            }
            None => false,
        }
    }

    /// Drop `id` from the registry without stopping its transport.
    pub fn remove(&self, id: &str) -> Option<Arc<dyn Transport>> {
        let removed = lock(&self.records).remove(id);
        if removed.is_some() {
            log::debug!("[ConnectionManager] Removing {} from the list of connections.", id);
        }
        removed.map(|record| record.transport)
    }

    /// Snapshot of `id`.
    pub fn get(&self, id: &str) -> Option<ConnectionInfo> {
        lock(&self.records).get(id).map(|record| ConnectionInfo {
            id: id.to_string(),
            kind: record.transport.kind(),
            last_activity: record.last_activity,
            state: record.transport.state(),
        })
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    /// True if no connection is registered.
    pub fn is_empty(&self) -> bool {
        lock(&self.records).is_empty()
    }

    /// Evict every connection idle for longer than `timeout` at `now`.
    ///
    /// Evicted transports are stopped with `TransportError::Timeout`.
    /// Returns the number of evicted connections.
    pub async fn scan(&self, now: Instant, timeout: Duration) -> usize {
        log::trace!("[ConnectionManager] Scanning connections for inactive ones.");

        let mut stale = Vec::new();
        lock(&self.records).retain(|id, record| {
            let idle = now.saturating_duration_since(record.last_activity);
            if idle > timeout {
                stale.push((id.clone(), Arc::clone(&record.transport)));
                false
            } else {
                true
            }
        });

        let evicted = stale.len();
        for (id, _) in &stale {
            log::debug!("[ConnectionManager] Removing {} from the list of connections.", id);
        }
        self.dispose_all(stale, Some(TransportError::Timeout)).await;
        evicted
    }

    /// Scan with the manager's clock and configured inactivity timeout.
    pub async fn scan_now(&self) -> usize {
        self.scan(self.clock.now(), self.inactivity_timeout).await
    }

    /// Remove and stop every connection. Used on server shutdown.
    pub async fn close_all(&self) -> usize {
        let all: Vec<(String, Arc<dyn Transport>)> = lock(&self.records)
            .drain()
            .map(|(id, record)| (id, record.transport))
            .collect();

        let count = all.len();
        if count > 0 {
            log::info!("[ConnectionManager] Closing {} connections.", count);
        }
        self.dispose_all(all, None).await;
        count
    }

    async fn dispose_all(&self, transports: Vec<(String, Arc<dyn Transport>)>, error: Option<TransportError>) {
        let mut tasks = JoinSet::new();
        for (id, transport) in transports {
            let error = error.clone();
            let timeout = self.dispose_timeout;
            tasks.spawn(async move {
                if tokio::time::timeout(timeout, transport.stop(error)).await.is_err() {
                    log::error!(
                        "[ConnectionManager] Failed disposing connection {}: not stopped within {:?}.",
                        id,
                        timeout
                    );
                }
            });
        }

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                log::error!("[ConnectionManager] Failed disposing connection: {}", e);
            }
        }
    }

    /// Run [`ConnectionManager::scan_now`] every scan interval until the
    /// returned handle is stopped or dropped.
    pub fn start_scanner(self: &Arc<Self>) -> ScannerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let manager = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.scan_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            log::debug!(
                "[ConnectionManager] Scanner started (interval {:?}, timeout {:?}).",
                manager.scan_interval,
                manager.inactivity_timeout
            );

            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {
                        manager.scan_now().await;
                    }
                }
            }
            log::debug!("[ConnectionManager] Scanner stopped.");
        });

        ScannerHandle {
            cancel,
            task: Some(task),
        }
    }

    /// Register `transport` and pump its events.
    ///
    /// Every received payload touches the record; the record is removed as
    /// soon as the transport reports closure. All events are forwarded on
    /// the returned receiver, `Closed` last.
    pub fn track(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        mut events: mpsc::Receiver<TransportEvent>,
    ) -> (String, mpsc::Receiver<TransportEvent>) {
        let id = self.register(Arc::clone(&transport));
        let (tx, rx) = mpsc::channel(RECEIVE_QUEUE_CAPACITY);
        let manager = Arc::clone(self);
        let connection_id = id.clone();

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let closed = matches!(event, TransportEvent::Closed(_));
                if closed {
                    manager.remove(&connection_id);
                } else {
                    manager.touch(&connection_id);
                }

                if tx.send(event).await.is_err() {
                    log::trace!("[ConnectionManager] Receiver for {} dropped.", connection_id);
                }
                if closed {
                    return;
                }
            }
            // Event channel ended without a close notification.
            manager.remove(&connection_id);
            let error = transport.close_error();
            log::debug!(
                "[ConnectionManager] Transport for {} closed without event: {:?}",
                connection_id,
                error
            );
            let _ = tx.send(TransportEvent::Closed(error)).await;
        });

        (id, rx)
    }
}

/// Handle to the periodic scanner task.
#[derive(Debug)]
pub struct ScannerHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ScannerHandle {
    /// Stop the scanner and wait for an in-progress scan to finish.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("[ConnectionManager] Scanner task failed: {}", e);
            }
        }
    }
}

impl Drop for ScannerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::TransportOptions;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct CountingTransport {
        stops: AtomicUsize,
        last_error: Mutex<Option<TransportError>>,
        hang_on_stop: AtomicBool,
    }

    impl CountingTransport {
        fn hanging() -> Arc<Self> {
            let transport = Self::default();
            transport.hang_on_stop.store(true, Ordering::SeqCst);
            Arc::new(transport)
        }

        fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for CountingTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::WebSockets
        }

        fn state(&self) -> TransportState {
            TransportState::Connected
        }

        async fn start(
            &self,
            _url: &str,
            _options: &TransportOptions,
            _events: mpsc::Sender<TransportEvent>,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&self, _payload: Bytes) -> Result<(), TransportError> {
            Ok(())
        }

        async fn stop(&self, error: Option<TransportError>) {
            self.stops.fetch_add(1, Ordering::SeqCst);
            *lock(&self.last_error) = error;
            if self.hang_on_stop.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
        }

        fn close_error(&self) -> Option<TransportError> {
            lock(&self.last_error).clone()
        }
    }

    fn manager(clock: Arc<ManualClock>) -> Arc<ConnectionManager> {
        let config = ServerConfig {
            dispose_timeout_ms: 50,
            ..ServerConfig::default()
        };
        ConnectionManager::with_clock(&config, clock)
    }

    #[tokio::test]
    async fn test_stale_connection_evicted_once_and_touched_survives() {
        let clock = Arc::new(ManualClock::new());
        let manager = manager(Arc::clone(&clock));
        let stale = Arc::new(CountingTransport::default());
        let active = Arc::new(CountingTransport::default());

        let stale_id = manager.register(Arc::clone(&stale) as Arc<dyn Transport>);
        let active_id = manager.register(Arc::clone(&active) as Arc<dyn Transport>);
        assert_ne!(stale_id, active_id);

        clock.advance(Duration::from_secs(10));
        assert!(manager.touch(&active_id));

        let evicted = manager.scan(clock.now(), Duration::from_secs(5)).await;
        assert_eq!(evicted, 1);
        assert!(manager.get(&stale_id).is_none());
        assert!(manager.get(&active_id).is_some());
        assert_eq!(stale.stops(), 1);
        assert_eq!(*lock(&stale.last_error), Some(TransportError::Timeout));
        assert_eq!(active.stops(), 0);

        // already removed, never stopped twice
        assert_eq!(manager.scan(clock.now(), Duration::from_secs(5)).await, 0);
        assert_eq!(stale.stops(), 1);
    }

    #[tokio::test]
    async fn test_idle_exactly_timeout_is_kept() {
        let clock = Arc::new(ManualClock::new());
        let manager = manager(Arc::clone(&clock));
        let id = manager.register(Arc::new(CountingTransport::default()));

        clock.advance(Duration::from_secs(5));
        assert_eq!(manager.scan(clock.now(), Duration::from_secs(5)).await, 0);
        assert!(manager.get(&id).is_some());
    }

    #[tokio::test]
    async fn test_stuck_dispose_does_not_block_others() {
        let clock = Arc::new(ManualClock::new());
        let manager = manager(Arc::clone(&clock));
        let stuck = CountingTransport::hanging();
        let normal = Arc::new(CountingTransport::default());

        manager.register(Arc::clone(&stuck) as Arc<dyn Transport>);
        manager.register(Arc::clone(&normal) as Arc<dyn Transport>);
        clock.advance(Duration::from_secs(60));

        assert_eq!(manager.scan(clock.now(), Duration::from_secs(1)).await, 2);
        assert!(manager.is_empty());
        assert_eq!(stuck.stops(), 1);
        assert_eq!(normal.stops(), 1);
    }

    #[tokio::test]
    async fn test_unknown_ids() {
        let manager = manager(Arc::new(ManualClock::new()));
        assert!(!manager.touch("missing"));
        assert!(manager.remove("missing").is_none());
        assert!(manager.get("missing").is_none());
    }

    #[tokio::test]
    async fn test_track_touches_and_removes_on_close() {
        let clock = Arc::new(ManualClock::new());
        let manager = manager(Arc::clone(&clock));
        let (tx, rx) = mpsc::channel(4);

        let (id, mut forwarded) = manager.track(Arc::new(CountingTransport::default()), rx);
        let registered_at = manager.get(&id).unwrap().last_activity;

        clock.advance(Duration::from_secs(30));
        tx.send(TransportEvent::Received(Bytes::from_static(b"\x01x"))).await.unwrap();
        assert_eq!(
            forwarded.recv().await,
            Some(TransportEvent::Received(Bytes::from_static(b"\x01x")))
        );
        let info = manager.get(&id).unwrap();
        assert_eq!(info.last_activity - registered_at, Duration::from_secs(30));
        assert_eq!(info.kind, TransportKind::WebSockets);

        tx.send(TransportEvent::Closed(None)).await.unwrap();
        assert_eq!(forwarded.recv().await, Some(TransportEvent::Closed(None)));
        assert!(manager.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_track_reports_close_error_when_event_missing() {
        let manager = manager(Arc::new(ManualClock::new()));
        let transport = Arc::new(CountingTransport::default());
        *lock(&transport.last_error) = Some(TransportError::Fatal("socket reset".into()));
        let (tx, rx) = mpsc::channel(4);

        let (id, mut forwarded) = manager.track(Arc::clone(&transport) as Arc<dyn Transport>, rx);
        drop(tx);

        assert_eq!(
            forwarded.recv().await,
            Some(TransportEvent::Closed(Some(TransportError::Fatal(
                "socket reset".into()
            ))))
        );
        assert_eq!(forwarded.recv().await, None);
        assert!(manager.get(&id).is_none());
    }

    #[tokio::test]
    async fn test_close_all_stops_everything() {
        let manager = manager(Arc::new(ManualClock::new()));
        let a = Arc::new(CountingTransport::default());
        let b = Arc::new(CountingTransport::default());
        manager.register(Arc::clone(&a) as Arc<dyn Transport>);
        manager.register(Arc::clone(&b) as Arc<dyn Transport>);

        assert_eq!(manager.close_all().await, 2);
        assert!(manager.is_empty());
        assert_eq!((a.stops(), b.stops()), (1, 1));
        assert_eq!(*lock(&a.last_error), None);
    }

    #[tokio::test]
    async fn test_scanner_evicts_in_background() {
        let config = ServerConfig {
            inactivity_timeout_ms: 30,
            scan_interval_ms: 10,
            dispose_timeout_ms: 50,
        };
        let manager = ConnectionManager::new(&config);
        let transport = Arc::new(CountingTransport::default());
        manager.register(Arc::clone(&transport) as Arc<dyn Transport>);

        let scanner = manager.start_scanner();
        tokio::time::sleep(Duration::from_millis(200)).await;
        scanner.stop().await;

        assert!(manager.is_empty());
        assert_eq!(transport.stops(), 1);
    }
}
