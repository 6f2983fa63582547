//! Pool and relay configuration.

use std::env;
use std::time::Duration;

use thiserror::Error;

pub const ENV_RELAYS: &str = "NOSTR_RELAYS";
pub const ENV_MAX_RELAYS: &str = "NOSTR_MAX_RELAYS";
pub const ENV_CONNECT_TIMEOUT_MS: &str = "NOSTR_RELAY_CONNECT_TIMEOUT_MS";
pub const ENV_RECONNECT_DELAY_MS: &str = "NOSTR_RELAY_RECONNECT_DELAY_MS";
pub const ENV_MAX_RECONNECT_ATTEMPTS: &str = "NOSTR_RELAY_MAX_RECONNECT_ATTEMPTS";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid NOSTR_MAX_RELAYS: {0}")]
    InvalidMaxRelays(String),
    #[error("invalid NOSTR_RELAY_CONNECT_TIMEOUT_MS: {0}")]
    InvalidConnectTimeout(String),
    #[error("invalid NOSTR_RELAY_RECONNECT_DELAY_MS: {0}")]
    InvalidReconnectDelay(String),
    #[error("invalid NOSTR_RELAY_MAX_RECONNECT_ATTEMPTS: {0}")]
    InvalidMaxReconnectAttempts(String),
}

/// Relay connection configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Upper bound on a single transport open.
    pub connect_timeout: Duration,
    /// Fixed wait before each reconnection attempt after an abnormal close.
    pub reconnect_delay: Duration,
    /// Consecutive reconnection attempts before the relay is marked failed.
    pub max_reconnect_attempts: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_attempts: 5,
        }
    }
}

/// Relay pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Relays opened by `connect_all`.
    pub relays: Vec<String>,
    /// Maximum number of relays in the pool.
    pub max_relays: usize,
    /// Relay configuration template.
    pub relay_config: RelayConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            relays: Vec::new(),
            max_relays: 16,
            relay_config: RelayConfig::default(),
        }
    }
}

impl PoolConfig {
    pub fn with_relays<I, S>(relays: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            relays: relays.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Load configuration from `NOSTR_*` environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let value = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let relays = value(ENV_RELAYS)
            .map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|relay| !relay.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let max_relays = match value(ENV_MAX_RELAYS) {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|error| ConfigError::InvalidMaxRelays(error.to_string()))?,
            None => defaults.max_relays,
        };
        let connect_timeout = match value(ENV_CONNECT_TIMEOUT_MS) {
            Some(raw) => Duration::from_millis(
                raw.parse::<u64>()
                    .map_err(|error| ConfigError::InvalidConnectTimeout(error.to_string()))?,
            ),
            None => defaults.relay_config.connect_timeout,
        };
        let reconnect_delay = match value(ENV_RECONNECT_DELAY_MS) {
            Some(raw) => Duration::from_millis(
                raw.parse::<u64>()
                    .map_err(|error| ConfigError::InvalidReconnectDelay(error.to_string()))?,
            ),
            None => defaults.relay_config.reconnect_delay,
        };
        let max_reconnect_attempts = match value(ENV_MAX_RECONNECT_ATTEMPTS) {
            Some(raw) => raw
                .parse::<u32>()
                .map_err(|error| ConfigError::InvalidMaxReconnectAttempts(error.to_string()))?,
            None => defaults.relay_config.max_reconnect_attempts,
        };

        Ok(Self {
            relays,
            max_relays,
            relay_config: RelayConfig {
                connect_timeout,
                reconnect_delay,
                max_reconnect_attempts,
            },
        })
    }
}
