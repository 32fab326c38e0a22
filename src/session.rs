//! Capture session control: inbound message types and the engine registry.
//!
//! Transports (HTTP, WebSocket, CLI) deserialize these messages and drive the
//! registry; the registry is a plain value owned by the process entry point
//! and passed to handlers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::capture::{CaptureConfig, CaptureEngine};
use crate::config;
use crate::error::AppError;
use crate::fanout::PacketFeed;

/// Session initiation message.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionRequest {
    pub target_pid: u32,
    /// Comma-separated database ports.
    #[serde(default = "default_db_filter")]
    pub db_filter: String,
    /// Comma-separated server IPs; empty means no host filter.
    #[serde(default)]
    pub server_filter: String,
}

fn default_db_filter() -> String {
    config::DEFAULT_DB_PORTS.to_string()
}

impl SessionRequest {
    /// Server IPs parsed from the filter string; malformed entries are
    /// skipped with a warning.
    pub fn server_ips(&self) -> Vec<IpAddr> {
        self.server_filter
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| match s.parse() {
                Ok(ip) => Some(ip),
                Err(_) => {
                    tracing::warn!("Ignoring malformed server IP: {s}");
                    None
                }
            })
            .collect()
    }

    pub fn capture_config(&self) -> CaptureConfig {
        let mut cfg = CaptureConfig::new(self.target_pid);
        cfg.db_ports = self.db_filter.clone();
        cfg.server_ips = self.server_ips();
        cfg
    }
}

/// In-session command, e.g. `{"command":"stop"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum SessionCommand {
    Stop,
}

/// Owns all running capture engines, keyed by session id.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u64, CaptureEngine>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start a capture session; returns its id.
    pub fn start_session(
        &self,
        request: &SessionRequest,
        feed: Arc<PacketFeed>,
    ) -> Result<u64, AppError> {
        let engine = CaptureEngine::start(request.capture_config(), feed)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.sessions.lock().unwrap().insert(id, engine);
        tracing::info!("Session {id} started for PID {}", request.target_pid);
        Ok(id)
    }

    /// Stop and remove a session. Returns whether it existed.
    pub fn stop_session(&self, id: u64) -> bool {
        let engine = self.sessions.lock().unwrap().remove(&id);
        match engine {
            Some(mut engine) => {
                engine.stop();
                tracing::info!("Session {id} stopped");
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        let engines: Vec<_> = {
            let mut sessions = self.sessions.lock().unwrap();
            sessions.drain().collect()
        };
        for (id, mut engine) in engines {
            engine.stop();
            tracing::info!("Session {id} stopped");
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_defaults() {
        let req: SessionRequest = serde_json::from_str(r#"{"target_pid": 1234}"#).unwrap();
        assert_eq!(req.target_pid, 1234);
        assert_eq!(req.db_filter, "3306,6379,5432");
        assert!(req.server_filter.is_empty());
        assert!(req.server_ips().is_empty());
    }

    #[test]
    fn test_request_with_filters() {
        let req: SessionRequest = serde_json::from_str(
            r#"{"target_pid": 1, "db_filter": "5432", "server_filter": "192.168.2.33, bogus, 14.119.115.229"}"#,
        )
        .unwrap();
        let ips = req.server_ips();
        assert_eq!(ips.len(), 2, "malformed entries are skipped");
        assert_eq!(ips[0], "192.168.2.33".parse::<IpAddr>().unwrap());

        let cfg = req.capture_config();
        assert_eq!(cfg.db_ports, "5432");
        assert_eq!(cfg.server_ips.len(), 2);
    }

    #[test]
    fn test_request_missing_pid_rejected() {
        assert!(serde_json::from_str::<SessionRequest>(r#"{"db_filter": "1"}"#).is_err());
    }

    #[test]
    fn test_stop_command_parses() {
        let cmd: SessionCommand = serde_json::from_str(r#"{"command":"stop"}"#).unwrap();
        assert_eq!(cmd, SessionCommand::Stop);
    }

    #[test]
    fn test_registry_rejects_bad_session() {
        let registry = SessionRegistry::new();
        let feed = Arc::new(PacketFeed::new());
        let req: SessionRequest =
            serde_json::from_str(&format!(r#"{{"target_pid": {}}}"#, u32::MAX - 1)).unwrap();
        assert!(registry.start_session(&req, feed).is_err());
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_stop_unknown_session() {
        let registry = SessionRegistry::new();
        assert!(!registry.stop_session(42));
    }
}
