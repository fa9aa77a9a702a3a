//! Engine configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

fn default_blocked_site_window_secs() -> u64 {
    5 * 60
}

fn default_heartbeat_interval_secs() -> u64 {
    60
}

fn default_heartbeat_stale_secs() -> u64 {
    2 * 60
}

fn default_blocked_status_codes() -> Vec<u16> {
    vec![403, 451]
}

/// Rejected engine settings
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineConfigError {
    #[error("heartbeat_interval_secs must be at least 1")]
    ZeroHeartbeatInterval,
}

/// Tunables of the Swift engine. Every field has a default so a partial
/// `[engine]` table in the daemon config is enough.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How long a top-level navigation is remembered for blocked-site attribution
    #[serde(default = "default_blocked_site_window_secs")]
    pub blocked_site_window_secs: u64,
    /// Heartbeat publishing period
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Age after which the UI treats the heartbeat as stale
    #[serde(default = "default_heartbeat_stale_secs")]
    pub heartbeat_stale_secs: u64,
    /// HTTP statuses of a top-level response that suggest blocking
    #[serde(default = "default_blocked_status_codes")]
    pub blocked_status_codes: Vec<u16>,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineConfigError> {
        if self.heartbeat_interval_secs == 0 {
            return Err(EngineConfigError::ZeroHeartbeatInterval);
        }
        Ok(())
    }

    pub fn blocked_site_window(&self) -> Duration {
        Duration::from_secs(self.blocked_site_window_secs)
    }

    /// Publishing period, never shorter than one second
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_stale_after(&self) -> Duration {
        Duration::from_secs(self.heartbeat_stale_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            blocked_site_window_secs: default_blocked_site_window_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_stale_secs: default_heartbeat_stale_secs(),
            blocked_status_codes: default_blocked_status_codes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.blocked_site_window(), Duration::from_secs(300));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(60));
        assert_eq!(config.heartbeat_stale_after(), Duration::from_secs(120));
        assert_eq!(config.blocked_status_codes, vec![403, 451]);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"heartbeat_interval_secs": 5}"#).unwrap();
        assert_eq!(config.heartbeat_interval_secs, 5);
        assert_eq!(config.blocked_site_window_secs, 300);
    }

    #[test]
    fn test_zero_heartbeat_interval() {
        let config = EngineConfig {
            heartbeat_interval_secs: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(EngineConfigError::ZeroHeartbeatInterval));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert!(EngineConfig::default().validate().is_ok());
    }
}
