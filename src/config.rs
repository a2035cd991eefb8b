//! Operational configuration, assembled from environment variables.
//!
//! Every operational environment key lands on a typed field here, validated
//! once at startup; a missing or malformed required key is a fatal
//! configuration error (exit code `1`).

use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },
}

/// Supervisor / actor pool sizing (`actor.*`).
#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// Accepted and validated against `max_pool_size`, but not wired to a
    /// pre-warm step: invocations are ephemeral per-request tasks, not
    /// pooled workers, so there is nothing to pre-warm (see DESIGN.md).
    pub min_pool_size: usize,
    pub max_pool_size: usize,
    pub mailbox_capacity: usize,
    pub handler_timeout_seconds: u64,
    /// Grace period a handler gets to react to cooperative cancellation
    /// (TTL expiry or shutdown) before its task is abandoned.
    pub cancellation_grace_seconds: u64,
    /// How long `shutdown()` waits for active invocations to drain before
    /// force-cancelling whatever is left.
    pub shutdown_drain_seconds: u64,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            min_pool_size: 4,
            max_pool_size: 64,
            mailbox_capacity: 256,
            handler_timeout_seconds: 300,
            cancellation_grace_seconds: 5,
            shutdown_drain_seconds: 30,
        }
    }
}

/// Streaming session manager limits (`streaming.*`).
#[derive(Debug, Clone)]
pub struct StreamingConfig {
    pub enabled: bool,
    pub default_ttl_minutes: u32,
    pub max_ttl_minutes: u32,
    pub max_concurrent_sessions: usize,
    pub default_response_channels: Vec<String>,
    pub max_publish_retries: u32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_ttl_minutes: 30,
            max_ttl_minutes: 240,
            max_concurrent_sessions: 1_000,
            default_response_channels: vec!["WebSocket".to_string()],
            max_publish_retries: 3,
        }
    }
}

/// User/api-key file locations (`security.*`).
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    pub users_file: Option<String>,
    pub api_keys_file: Option<String>,
}

/// Reconnect policy shared by every transport variant.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub network_recovery_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(1_000),
            max: Duration::from_millis(60_000),
            network_recovery_interval: Duration::from_millis(10_000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub actor: ActorConfig,
    pub streaming: StreamingConfig,
    pub security: SecurityConfig,
    pub reconnect: ReconnectPolicy,
    pub recent_state_capacity: usize,
    pub recent_state_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            actor: ActorConfig::default(),
            streaming: StreamingConfig::default(),
            security: SecurityConfig::default(),
            reconnect: ReconnectPolicy::default(),
            recent_state_capacity: 1_000,
            recent_state_retention: Duration::from_secs(3_600),
        }
    }
}

fn parse_env<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

impl Config {
    /// Loads `.env` (if present) and overlays environment variables onto the defaults.
    /// Unset keys keep their default; malformed keys are fatal.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let defaults = Self::default();

        let actor = ActorConfig {
            min_pool_size: parse_env("actor.min_pool_size", defaults.actor.min_pool_size)?,
            max_pool_size: parse_env("actor.max_pool_size", defaults.actor.max_pool_size)?,
            mailbox_capacity: parse_env("actor.mailbox_capacity", defaults.actor.mailbox_capacity)?,
            handler_timeout_seconds: parse_env(
                "actor.handler_timeout_seconds",
                defaults.actor.handler_timeout_seconds,
            )?,
            cancellation_grace_seconds: parse_env(
                "actor.cancellation_grace_seconds",
                defaults.actor.cancellation_grace_seconds,
            )?,
            shutdown_drain_seconds: parse_env(
                "actor.shutdown_drain_seconds",
                defaults.actor.shutdown_drain_seconds,
            )?,
        };

        let streaming = StreamingConfig {
            enabled: parse_env("streaming.enabled", defaults.streaming.enabled)?,
            default_ttl_minutes: parse_env(
                "streaming.default_ttl_minutes",
                defaults.streaming.default_ttl_minutes,
            )?,
            max_ttl_minutes: parse_env("streaming.max_ttl_minutes", defaults.streaming.max_ttl_minutes)?,
            max_concurrent_sessions: parse_env(
                "streaming.max_concurrent_sessions",
                defaults.streaming.max_concurrent_sessions,
            )?,
            default_response_channels: env::var("streaming.default_response_channels")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.streaming.default_response_channels),
            max_publish_retries: defaults.streaming.max_publish_retries,
        };

        let security = SecurityConfig {
            users_file: env::var("security.users_file").ok(),
            api_keys_file: env::var("security.api_keys_file").ok(),
        };

        let reconnect = ReconnectPolicy {
            initial: Duration::from_millis(parse_env("reconnect_initial_ms", defaults.reconnect.initial.as_millis() as u64)?),
            max: Duration::from_millis(parse_env("reconnect_max_ms", defaults.reconnect.max.as_millis() as u64)?),
            network_recovery_interval: Duration::from_millis(parse_env(
                "network_recovery_interval_ms",
                defaults.reconnect.network_recovery_interval.as_millis() as u64,
            )?),
        };

        if actor.min_pool_size > actor.max_pool_size {
            return Err(ConfigError::Invalid {
                key: "actor.min_pool_size",
                value: actor.min_pool_size.to_string(),
            });
        }
        if streaming.default_ttl_minutes > streaming.max_ttl_minutes {
            return Err(ConfigError::Invalid {
                key: "streaming.default_ttl_minutes",
                value: streaming.default_ttl_minutes.to_string(),
            });
        }
        if reconnect.initial > reconnect.max {
            return Err(ConfigError::Invalid {
                key: "reconnect_initial_ms",
                value: reconnect.initial.as_millis().to_string(),
            });
        }

        Ok(Self {
            actor,
            streaming,
            security,
            reconnect,
            recent_state_capacity: defaults.recent_state_capacity,
            recent_state_retention: defaults.recent_state_retention,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let cfg = Config::default();
        assert!(cfg.actor.min_pool_size <= cfg.actor.max_pool_size);
        assert!(cfg.streaming.default_ttl_minutes <= cfg.streaming.max_ttl_minutes);
    }

    #[test]
    fn parse_env_falls_back_to_default_when_unset() {
        let value: usize = parse_env("dgfacade.__does_not_exist__", 42).unwrap();
        assert_eq!(value, 42);
    }
}
