// Copyright 2020 Joyent, Inc.

//! Tunables for client and server sessions. Both structs deserialize from a
//! partial JSON object; missing fields take their defaults.

use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1000;
pub const DEFAULT_HEARTBEAT_IDLE_MS: u64 = 1000;
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_REAP_INTERVAL_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClntConfig {
    /// Per-address connect timeout.
    pub connect_timeout_ms: u64,
    /// Send a heartbeat after this much idle time. `None` disables
    /// heartbeats.
    pub heartbeat_idle_ms: Option<u64>,
}

impl Default for ClntConfig {
    fn default() -> Self {
        ClntConfig {
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            heartbeat_idle_ms: Some(DEFAULT_HEARTBEAT_IDLE_MS),
        }
    }
}

impl ClntConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_idle(&self) -> Option<Duration> {
        self.heartbeat_idle_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrvConfig {
    /// A session that has not been heard from for this long is detached.
    pub session_timeout_ms: u64,
    /// How often the reaper scans the session table.
    pub reap_interval_ms: u64,
    /// This server's identity when it proposes a detach.
    pub replica_id: u64,
}

impl Default for SrvConfig {
    fn default() -> Self {
        SrvConfig {
            session_timeout_ms: DEFAULT_SESSION_TIMEOUT_MS,
            reap_interval_ms: DEFAULT_REAP_INTERVAL_MS,
            replica_id: 0,
        }
    }
}

impl SrvConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_config_takes_defaults() {
        let cfg: SrvConfig =
            serde_json::from_str(r#"{"session_timeout_ms": 250}"#).unwrap();
        assert_eq!(cfg.session_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.reap_interval_ms, DEFAULT_REAP_INTERVAL_MS);
        assert_eq!(cfg.replica_id, 0);
    }

    #[test]
    fn heartbeats_can_be_disabled() {
        let cfg: ClntConfig =
            serde_json::from_str(r#"{"heartbeat_idle_ms": null}"#).unwrap();
        assert_eq!(cfg.heartbeat_idle(), None);
        assert_eq!(cfg.connect_timeout_ms, DEFAULT_CONNECT_TIMEOUT_MS);
        assert_eq!(
            ClntConfig::default().heartbeat_idle(),
            Some(Duration::from_millis(DEFAULT_HEARTBEAT_IDLE_MS))
        );
    }
}
