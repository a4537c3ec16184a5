//! Session controller configuration.
//!
//! Configuration is loaded from environment variables with defaults
//! matching the shipped behavior. Relay credentials are redacted in Debug
//! output.

use std::collections::HashMap;
use std::env;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::RetryPolicy;

/// Default base delay between reconnection attempts, in milliseconds.
pub const DEFAULT_RETRY_BASE_MS: u64 = 2000;

/// Default backoff multiplier per consecutive failure.
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 1.5;

/// Default backoff ceiling in milliseconds.
pub const DEFAULT_RETRY_CAP_MS: u64 = 20_000;

/// Default reconnection attempt budget.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Default wait for our own registration to report open, in milliseconds.
pub const DEFAULT_REGISTRATION_OPEN_TIMEOUT_MS: u64 = 15_000;

/// Default wait for the registration channel to open, in milliseconds.
pub const DEFAULT_CHANNEL_OPEN_TIMEOUT_MS: u64 = 12_000;

/// Default wait for the broadcaster's callback, in milliseconds.
pub const DEFAULT_INBOUND_CALL_TIMEOUT_MS: u64 = 15_000;

/// Default wait for the remote stream on an answered call, in milliseconds.
pub const DEFAULT_REMOTE_STREAM_TIMEOUT_MS: u64 = 15_000;

/// Default playback stats sampling period, in milliseconds.
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 2000;

/// Default audio meter sampling period, in milliseconds.
pub const DEFAULT_METER_INTERVAL_MS: u64 = 16;

/// Default pause before re-registering after a broadcaster identity
/// conflict, in milliseconds.
pub const DEFAULT_CONFLICT_RETRY_DELAY_MS: u64 = 500;

/// Default pause before retrying after a viewer self-identity collision,
/// in milliseconds.
pub const DEFAULT_COLLISION_RETRY_DELAY_MS: u64 = 100;

/// Default origin for viewer-facing share addresses.
pub const DEFAULT_SHARE_ORIGIN: &str = "https://streamcast.example";

/// One STUN or TURN relay the transport may traverse through.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Protected from accidental logging by the custom Debug below.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl RelayEndpoint {
    /// A credential-less STUN endpoint.
    #[must_use]
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            username: None,
            credential: None,
        }
    }

    /// A TURN endpoint with username and credential.
    #[must_use]
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

impl fmt::Debug for RelayEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayEndpoint")
            .field("url", &self.url)
            .field("username", &self.username)
            .field(
                "credential",
                &self.credential.as_ref().map(|_| "[REDACTED]"),
            )
            .finish()
    }
}

/// Relay set used when none is configured: public STUN plus an open TURN
/// fallback for symmetric-NAT paths.
#[must_use]
pub fn default_relay_endpoints() -> Vec<RelayEndpoint> {
    vec![
        RelayEndpoint::stun("stun:stun.l.google.com:19302"),
        RelayEndpoint::stun("stun:stun1.l.google.com:19302"),
        RelayEndpoint::stun("stun:stun2.l.google.com:19302"),
        RelayEndpoint::stun("stun:stun3.l.google.com:19302"),
        RelayEndpoint::stun("stun:stun4.l.google.com:19302"),
        RelayEndpoint::turn(
            "turn:openrelay.metered.ca:80",
            "openrelayproject",
            "openrelayproject",
        ),
        RelayEndpoint::turn(
            "turn:openrelay.metered.ca:443",
            "openrelayproject",
            "openrelayproject",
        ),
        RelayEndpoint::turn(
            "turn:openrelay.metered.ca:443?transport=tcp",
            "openrelayproject",
            "openrelayproject",
        ),
    ]
}

/// Session controller configuration.
///
/// Loaded from environment variables with defaults matching the shipped
/// behavior.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Relays handed to the transport on every registration.
    pub relay_endpoints: Vec<RelayEndpoint>,

    /// Base delay between reconnection attempts (default: 2000).
    pub retry_base_ms: u64,

    /// Backoff multiplier per consecutive failure (default: 1.5).
    pub retry_multiplier: f64,

    /// Backoff ceiling (default: 20000).
    pub retry_cap_ms: u64,

    /// Reconnection attempt budget (default: 8).
    pub max_attempts: u32,

    /// Wait for our registration to report open (default: 15000).
    pub registration_open_timeout_ms: u64,

    /// Wait for the registration channel to open (default: 12000).
    pub channel_open_timeout_ms: u64,

    /// Wait for the broadcaster's callback (default: 15000).
    pub inbound_call_timeout_ms: u64,

    /// Wait for the remote stream on an answered call (default: 15000).
    pub remote_stream_timeout_ms: u64,

    /// Playback stats sampling period (default: 2000).
    pub stats_interval_ms: u64,

    /// Audio meter sampling period (default: 16).
    pub meter_interval_ms: u64,

    /// Pause before re-registering after a broadcaster identity conflict
    /// (default: 500).
    pub conflict_retry_delay_ms: u64,

    /// Pause before retrying a viewer self-identity collision (default: 100).
    pub collision_retry_delay_ms: u64,

    /// Origin for viewer-facing share addresses.
    pub share_origin: String,

    /// Path segment between origin and fragment in share addresses.
    pub share_path: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_endpoints: default_relay_endpoints(),
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            retry_multiplier: DEFAULT_RETRY_MULTIPLIER,
            retry_cap_ms: DEFAULT_RETRY_CAP_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            registration_open_timeout_ms: DEFAULT_REGISTRATION_OPEN_TIMEOUT_MS,
            channel_open_timeout_ms: DEFAULT_CHANNEL_OPEN_TIMEOUT_MS,
            inbound_call_timeout_ms: DEFAULT_INBOUND_CALL_TIMEOUT_MS,
            remote_stream_timeout_ms: DEFAULT_REMOTE_STREAM_TIMEOUT_MS,
            stats_interval_ms: DEFAULT_STATS_INTERVAL_MS,
            meter_interval_ms: DEFAULT_METER_INTERVAL_MS,
            conflict_retry_delay_ms: DEFAULT_CONFLICT_RETRY_DELAY_MS,
            collision_retry_delay_ms: DEFAULT_COLLISION_RETRY_DELAY_MS,
            share_origin: DEFAULT_SHARE_ORIGIN.to_string(),
            share_path: String::new(),
        }
    }
}

/// Custom Debug implementation; relay credentials are redacted through
/// `RelayEndpoint`'s own Debug.
impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("relay_endpoints", &self.relay_endpoints)
            .field("retry_base_ms", &self.retry_base_ms)
            .field("retry_multiplier", &self.retry_multiplier)
            .field("retry_cap_ms", &self.retry_cap_ms)
            .field("max_attempts", &self.max_attempts)
            .field(
                "registration_open_timeout_ms",
                &self.registration_open_timeout_ms,
            )
            .field("channel_open_timeout_ms", &self.channel_open_timeout_ms)
            .field("inbound_call_timeout_ms", &self.inbound_call_timeout_ms)
            .field("remote_stream_timeout_ms", &self.remote_stream_timeout_ms)
            .field("stats_interval_ms", &self.stats_interval_ms)
            .field("meter_interval_ms", &self.meter_interval_ms)
            .field("conflict_retry_delay_ms", &self.conflict_retry_delay_ms)
            .field("collision_retry_delay_ms", &self.collision_retry_delay_ms)
            .field("share_origin", &self.share_origin)
            .field("share_path", &self.share_path)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl SessionConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = SessionConfig::default();

        let relay_endpoints = match vars.get("SC_RELAY_ENDPOINTS") {
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                ConfigError::InvalidValue(format!("SC_RELAY_ENDPOINTS: {e}"))
            })?,
            None => defaults.relay_endpoints,
        };

        let retry_base_ms = vars
            .get("SC_RETRY_BASE_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RETRY_BASE_MS);

        let retry_multiplier = vars
            .get("SC_RETRY_MULTIPLIER")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RETRY_MULTIPLIER);

        let retry_cap_ms = vars
            .get("SC_RETRY_CAP_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_RETRY_CAP_MS);

        let max_attempts = vars
            .get("SC_MAX_ATTEMPTS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        let registration_open_timeout_ms = vars
            .get("SC_REGISTRATION_OPEN_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_REGISTRATION_OPEN_TIMEOUT_MS);

        let channel_open_timeout_ms = vars
            .get("SC_CHANNEL_OPEN_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CHANNEL_OPEN_TIMEOUT_MS);

        let inbound_call_timeout_ms = vars
            .get("SC_INBOUND_CALL_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_INBOUND_CALL_TIMEOUT_MS);

        let remote_stream_timeout_ms = vars
            .get("SC_REMOTE_STREAM_TIMEOUT_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_REMOTE_STREAM_TIMEOUT_MS);

        let stats_interval_ms = vars
            .get("SC_STATS_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_STATS_INTERVAL_MS);

        let meter_interval_ms = vars
            .get("SC_METER_INTERVAL_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_METER_INTERVAL_MS);

        let conflict_retry_delay_ms = vars
            .get("SC_CONFLICT_RETRY_DELAY_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_CONFLICT_RETRY_DELAY_MS);

        let collision_retry_delay_ms = vars
            .get("SC_COLLISION_RETRY_DELAY_MS")
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_COLLISION_RETRY_DELAY_MS);

        let share_origin = vars
            .get("SC_SHARE_ORIGIN")
            .cloned()
            .unwrap_or_else(|| DEFAULT_SHARE_ORIGIN.to_string());

        let share_path = vars.get("SC_SHARE_PATH").cloned().unwrap_or_default();

        let config = SessionConfig {
            relay_endpoints,
            retry_base_ms,
            retry_multiplier,
            retry_cap_ms,
            max_attempts,
            registration_open_timeout_ms,
            channel_open_timeout_ms,
            inbound_call_timeout_ms,
            remote_stream_timeout_ms,
            stats_interval_ms,
            meter_interval_ms,
            conflict_retry_delay_ms,
            collision_retry_delay_ms,
            share_origin,
            share_path,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "SC_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.retry_multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "SC_RETRY_MULTIPLIER must be at least 1.0".to_string(),
            ));
        }
        if self.retry_cap_ms < self.retry_base_ms {
            return Err(ConfigError::InvalidValue(
                "SC_RETRY_CAP_MS must not be below SC_RETRY_BASE_MS".to_string(),
            ));
        }
        if self.meter_interval_ms == 0 || self.stats_interval_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "telemetry intervals must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// The backoff parameters as a [`RetryPolicy`].
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_ms: self.retry_base_ms,
            multiplier: self.retry_multiplier,
            cap_ms: self.retry_cap_ms,
            max_attempts: self.max_attempts,
        }
    }

    #[must_use]
    pub fn registration_open_timeout(&self) -> Duration {
        Duration::from_millis(self.registration_open_timeout_ms)
    }

    #[must_use]
    pub fn channel_open_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_open_timeout_ms)
    }

    #[must_use]
    pub fn inbound_call_timeout(&self) -> Duration {
        Duration::from_millis(self.inbound_call_timeout_ms)
    }

    #[must_use]
    pub fn remote_stream_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_stream_timeout_ms)
    }

    #[must_use]
    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    #[must_use]
    pub fn meter_interval(&self) -> Duration {
        Duration::from_millis(self.meter_interval_ms)
    }

    #[must_use]
    pub fn conflict_retry_delay(&self) -> Duration {
        Duration::from_millis(self.conflict_retry_delay_ms)
    }

    #[must_use]
    pub fn collision_retry_delay(&self) -> Duration {
        Duration::from_millis(self.collision_retry_delay_ms)
    }
}
