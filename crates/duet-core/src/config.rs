//! Configuration system for duet
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/duet/config.toml
//! - Linux: ~/.config/duet/config.toml
//! - Windows: %APPDATA%/duet/config.toml
//!
//! Every tunable timer lives here and is handed to the session or the
//! rendezvous service at construction time.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session lifecycle timers
    pub session: SessionConfig,
    /// Rendezvous service (server side) settings
    pub signal: SignalConfig,
    /// Rendezvous client settings
    pub rendezvous: RendezvousConfig,
    /// Peer transport settings
    pub transport: TransportConfig,
}

/// Session lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Close the session after this long without application traffic
    pub idle_timeout_ms: u64,
    /// Interval between keepalive pings once connected
    pub keepalive_interval_ms: u64,
    /// How long to wait for a pong before counting a miss
    pub keepalive_timeout_ms: u64,
    /// Consecutive misses that trigger a restart
    pub keepalive_miss_threshold: u32,
    /// Minimum spacing between keepalive-triggered restarts
    pub keepalive_restart_cooldown_ms: u64,
    /// First join retry delay
    pub join_retry_base_ms: u64,
    /// Growth factor applied per join attempt
    pub join_retry_factor: f64,
    /// Upper bound on a single join retry delay
    pub join_retry_cap_ms: u64,
    /// Total join retry budget before the final attempt
    pub join_retry_total_ms: u64,
    /// Joiner connect watchdog, also the hub spoke handshake window
    pub connect_watchdog_ms: u64,
    /// Blind ICE restarts allowed per failure episode
    pub max_blind_restarts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 2 * 60 * 1000,
            keepalive_interval_ms: 10_000,
            keepalive_timeout_ms: 5_000,
            keepalive_miss_threshold: 3,
            keepalive_restart_cooldown_ms: 30_000,
            join_retry_base_ms: 600,
            join_retry_factor: 1.4,
            join_retry_cap_ms: 2_000,
            join_retry_total_ms: 15_000,
            connect_watchdog_ms: 12_000,
            max_blind_restarts: 2,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_millis(self.keepalive_timeout_ms)
    }

    pub fn keepalive_restart_cooldown(&self) -> Duration {
        Duration::from_millis(self.keepalive_restart_cooldown_ms)
    }

    pub fn join_retry_total(&self) -> Duration {
        Duration::from_millis(self.join_retry_total_ms)
    }

    pub fn connect_watchdog(&self) -> Duration {
        Duration::from_millis(self.connect_watchdog_ms)
    }

    /// Delay before join retry number `attempt` (0-based):
    /// `min(base * factor^attempt, cap)`
    pub fn join_retry_delay(&self, attempt: u32) -> Duration {
        let exp = self.join_retry_factor.powi(attempt.min(64) as i32);
        let ms = (self.join_retry_base_ms as f64 * exp)
            .round()
            .min(self.join_retry_cap_ms as f64);
        Duration::from_millis(ms as u64)
    }
}

/// Rendezvous service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalConfig {
    /// Signal server port
    pub port: u16,
    /// Bind address
    pub bind: IpAddr,
    /// Unanswered rooms are deleted after this long
    pub room_ttl_ms: u64,
    /// How long a join waits for a creator before `not_found`
    pub join_wait_ms: u64,
    /// Creator candidates kept per room until a joiner shows up
    pub max_buffered_candidates: usize,
    /// Keys accepted for hub rooms (empty = accept any key)
    pub hub_keys: Vec<String>,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_SIGNAL_PORT,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            room_ttl_ms: 2 * 60 * 1000,
            join_wait_ms: 30_000,
            max_buffered_candidates: 64,
            hub_keys: Vec::new(),
        }
    }
}

impl SignalConfig {
    pub fn room_ttl(&self) -> Duration {
        Duration::from_millis(self.room_ttl_ms)
    }

    pub fn join_wait(&self) -> Duration {
        Duration::from_millis(self.join_wait_ms)
    }
}

/// Rendezvous client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Rendezvous service URL
    pub url: String,
    /// Delay before the first reconnect
    pub reconnect_base_ms: u64,
    /// Added per consecutive reconnect
    pub reconnect_step_ms: u64,
    /// Reconnect delay ceiling
    pub reconnect_max_ms: u64,
    /// WebSocket connect timeout
    pub connect_timeout_ms: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            url: format!("ws://localhost:{}", crate::DEFAULT_SIGNAL_PORT),
            reconnect_base_ms: 2_000,
            reconnect_step_ms: 500,
            reconnect_max_ms: 4_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl RendezvousConfig {
    /// `min(base + count * step, max)`
    pub fn reconnect_delay(&self, reconnect_count: u32) -> Duration {
        let ms = self
            .reconnect_base_ms
            .saturating_add(self.reconnect_step_ms.saturating_mul(reconnect_count as u64))
            .min(self.reconnect_max_ms);
        Duration::from_millis(ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Peer transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// STUN/TURN server URLs
    pub ice_servers: Vec<String>,
    /// Label of the chat data channel
    pub channel_label: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            channel_label: "duet".into(),
        }
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("chat", "duet", "duet").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}
