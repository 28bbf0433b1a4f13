//! Engine configuration.

use std::time::Duration;

use crate::error::ConfigError;

/// Push-channel connection settings.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Base WebSocket URL, e.g. `wss://pulse.example.com`.
    pub ws_base_url: String,
    /// Timeout for a single connect attempt.
    pub connect_timeout: Duration,
    /// Base delay for reconnection backoff (doubles per attempt).
    pub reconnect_base: Duration,
    /// Reconnection attempts before the handle parks in `Errored`.
    pub max_reconnect_attempts: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://127.0.0.1:8090".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_base: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
        }
    }
}

/// Engine configuration for one task group.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub channel: ChannelConfig,
    /// Base URL of the REST API (batch trigger, history read).
    pub api_base_url: String,
    /// Grace delay between batch completion and closing the channel, so
    /// trailing frames still land.
    pub close_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            api_base_url: "http://127.0.0.1:8090".to_string(),
            close_grace: Duration::from_secs(2),
        }
    }
}

impl EngineConfig {
    /// Build a config from `SOURCE_PULSE_*` environment variables.
    ///
    /// `SOURCE_PULSE_WS_URL` and `SOURCE_PULSE_API_URL` are required; the
    /// timing knobs fall back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let ws_base_url = require_env("SOURCE_PULSE_WS_URL")?;
        let api_base_url = require_env("SOURCE_PULSE_API_URL")?;

        let defaults = Self::default();
        let channel = ChannelConfig {
            ws_base_url,
            connect_timeout: env_duration_secs("SOURCE_PULSE_CONNECT_TIMEOUT_SECS")?
                .unwrap_or(defaults.channel.connect_timeout),
            reconnect_base: env_duration_millis("SOURCE_PULSE_RECONNECT_BASE_MS")?
                .unwrap_or(defaults.channel.reconnect_base),
            max_reconnect_attempts: env_u32("SOURCE_PULSE_RECONNECT_ATTEMPTS")?
                .unwrap_or(defaults.channel.max_reconnect_attempts),
        };

        Ok(Self {
            channel,
            api_base_url,
            close_grace: env_duration_secs("SOURCE_PULSE_CLOSE_GRACE_SECS")?
                .unwrap_or(defaults.close_grace),
        })
    }
}

fn require_env(key: &str) -> Result<String, ConfigError> {
    std::env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
}

fn env_u32(key: &str) -> Result<Option<u32>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
        Err(_) => Ok(None),
    }
}

fn env_duration_secs(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_u32(key)?.map(|secs| Duration::from_secs(u64::from(secs))))
}

fn env_duration_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_u32(key)?.map(|ms| Duration::from_millis(u64::from(ms))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.channel.reconnect_base, Duration::from_millis(1000));
        assert_eq!(config.channel.max_reconnect_attempts, 5);
        assert!(config.close_grace >= Duration::from_millis(500));
    }

    #[test]
    fn missing_env_is_reported_by_key() {
        let err = require_env("SOURCE_PULSE_TEST_DOES_NOT_EXIST").unwrap_err();
        match err {
            ConfigError::MissingEnvVar(key) => {
                assert_eq!(key, "SOURCE_PULSE_TEST_DOES_NOT_EXIST")
            }
            other => panic!("expected MissingEnvVar, got {other:?}"),
        }
    }
}
