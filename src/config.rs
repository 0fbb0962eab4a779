//! Configuration loading.
//!
//! Client and server settings are plain `serde` structs. Values come from the
//! defaults in [`crate::constants`], then an optional JSON file, then
//! `HUBSOCKETS_*` environment variables.
//!
//! ```json
//! {
//!   "transports": ["WebSockets", "LongPolling"],
//!   "start_timeout_ms": 5000,
//!   "poll_timeout_ms": 30000
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::transport::{TransportKind, TransportOptions};

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Settings for a [`crate::connection::ClientConnection`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    /// Candidate transports in preference order.
    pub transports: Vec<TransportKind>,
    /// Timeout for the negotiate request.
    pub negotiate_timeout_ms: u64,
    /// Per-candidate transport start timeout.
    pub start_timeout_ms: u64,
    /// Long-poll hold time.
    pub poll_timeout_ms: u64,
    /// Consecutive transient poll failures tolerated.
    pub max_poll_retries: u32,
    /// Bound on waiting for transport loops during shutdown.
    pub shutdown_grace_ms: u64,
    /// Largest accepted frame payload.
    pub max_message_size: usize,
    /// Outbound queue capacity.
    pub send_queue_capacity: usize,
    /// Inbound event queue capacity.
    pub receive_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            transports: TransportKind::ALL.to_vec(),
            negotiate_timeout_ms: millis(constants::NEGOTIATE_TIMEOUT),
            start_timeout_ms: millis(constants::TRANSPORT_START_TIMEOUT),
            poll_timeout_ms: millis(constants::POLL_TIMEOUT),
            max_poll_retries: constants::MAX_POLL_RETRIES,
            shutdown_grace_ms: millis(constants::SHUTDOWN_GRACE),
            max_message_size: constants::MAX_MESSAGE_SIZE,
            send_queue_capacity: constants::SEND_QUEUE_CAPACITY,
            receive_queue_capacity: constants::RECEIVE_QUEUE_CAPACITY,
        }
    }
}

impl ClientConfig {
    /// Load from the default location, falling back to defaults, then apply
    /// environment overrides.
    pub fn load() -> Self {
        let mut config = default_path()
            .and_then(|path| Self::load_from_file(&path).ok())
            .unwrap_or_default();
        config.apply_env_overrides();
        config
    }

    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Apply `HUBSOCKETS_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(list) = var("HUBSOCKETS_TRANSPORTS") {
            let parsed: Result<Vec<TransportKind>, String> = list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::parse)
                .collect();
            match parsed {
                Ok(kinds) if !kinds.is_empty() => self.transports = kinds,
                Ok(_) => {}
                Err(e) => log::warn!("[Config] Ignoring HUBSOCKETS_TRANSPORTS: {}", e),
            }
        }

        if let Some(ms) = var("HUBSOCKETS_START_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.start_timeout_ms = ms;
        }

        if let Some(ms) = var("HUBSOCKETS_POLL_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.poll_timeout_ms = ms;
        }

        if let Some(size) = var("HUBSOCKETS_MAX_MESSAGE_SIZE").and_then(|v| v.parse().ok()) {
            self.max_message_size = size;
        }
    }

    /// Negotiate request timeout.
    pub fn negotiate_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiate_timeout_ms)
    }

    /// Per-candidate start timeout.
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Options handed to each transport's `start`.
    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            max_poll_retries: self.max_poll_retries,
            shutdown_grace: Duration::from_millis(self.shutdown_grace_ms),
            send_queue_capacity: self.send_queue_capacity,
            max_message_size: self.max_message_size,
            headers: Vec::new(),
        }
    }
}

/// Settings for a [`crate::server::ConnectionManager`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Idle time after which a connection is evicted.
    pub inactivity_timeout_ms: u64,
    /// Interval between scans.
    pub scan_interval_ms: u64,
    /// Bound on disposing one evicted connection.
    pub dispose_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_ms: millis(constants::INACTIVITY_TIMEOUT),
            scan_interval_ms: millis(constants::SCAN_INTERVAL),
            dispose_timeout_ms: millis(constants::DISPOSE_TIMEOUT),
        }
    }
}

impl ServerConfig {
    /// Read a JSON config file. Missing fields keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Apply `HUBSOCKETS_*` environment variables.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(ms) = var("HUBSOCKETS_INACTIVITY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.inactivity_timeout_ms = ms;
        }
        if let Some(ms) = var("HUBSOCKETS_SCAN_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.scan_interval_ms = ms;
        }
    }

    /// Inactivity timeout.
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    /// Scan interval.
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Per-connection dispose timeout.
    pub fn dispose_timeout(&self) -> Duration {
        Duration::from_millis(self.dispose_timeout_ms)
    }
}

/// `<platform config dir>/hubsockets/config.json`, if the platform has one.
pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("hubsockets").join("config.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_match_constants() {
        let config = ClientConfig::default();
        assert_eq!(config.transports, TransportKind::ALL.to_vec());
        assert_eq!(config.start_timeout(), constants::TRANSPORT_START_TIMEOUT);

        let options = config.transport_options();
        assert_eq!(options.poll_timeout, constants::POLL_TIMEOUT);
        assert_eq!(options.max_message_size, constants::MAX_MESSAGE_SIZE);

        let server = ServerConfig::default();
        assert_eq!(server.inactivity_timeout(), constants::INACTIVITY_TIMEOUT);
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{"transports":["LongPolling"],"poll_timeout_ms":2500}"#).unwrap();

        let config = ClientConfig::load_from_file(&path).unwrap();
        assert_eq!(config.transports, vec![TransportKind::LongPolling]);
        assert_eq!(config.poll_timeout_ms, 2500);
        assert_eq!(config.max_poll_retries, constants::MAX_POLL_RETRIES);
    }

    #[test]
    fn test_load_invalid_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ nope").unwrap();
        assert!(ClientConfig::load_from_file(&path).is_err());
        assert!(ClientConfig::load_from_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn test_client_env_overrides() {
        let mut config = ClientConfig::default();
        config.apply_overrides(vars(&[
            ("HUBSOCKETS_TRANSPORTS", "lp, sse"),
            ("HUBSOCKETS_START_TIMEOUT_MS", "1200"),
            ("HUBSOCKETS_MAX_MESSAGE_SIZE", "not-a-number"),
        ]));

        assert_eq!(
            config.transports,
            vec![TransportKind::LongPolling, TransportKind::ServerSentEvents]
        );
        assert_eq!(config.start_timeout_ms, 1200);
        assert_eq!(config.max_message_size, constants::MAX_MESSAGE_SIZE);
    }

    #[test]
    fn test_bad_transport_list_is_ignored() {
        let mut config = ClientConfig::default();
        config.apply_overrides(vars(&[("HUBSOCKETS_TRANSPORTS", "ws,smoke-signals")]));
        assert_eq!(config.transports, TransportKind::ALL.to_vec());
    }

    #[test]
    fn test_server_file_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        fs::write(&path, r#"{"inactivity_timeout_ms":1000}"#).unwrap();

        let mut config = ServerConfig::load_from_file(&path).unwrap();
        config.apply_overrides(vars(&[("HUBSOCKETS_SCAN_INTERVAL_MS", "250")]));
        assert_eq!(config.inactivity_timeout(), Duration::from_secs(1));
        assert_eq!(config.scan_interval(), Duration::from_millis(250));
        assert_eq!(config.dispose_timeout(), constants::DISPOSE_TIMEOUT);
    }
}
