//! Session configuration.
//!
//! Configuration is loaded from JSON (every field optional) and can be
//! overridden from the environment:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `INKMESH_RELAY_URL` | `relay_url` |
//! | `INKMESH_RENDEZVOUS_URL` | `rendezvous_url` |
//! | `INKMESH_LISTEN_ADDR` | `listen_addr` |
//! | `INKMESH_ADVERTISE_ADDR` | `advertise_addr` |
//! | `INKMESH_LABEL` | `label` |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::input::DEFAULT_MIN_POINT_DISTANCE_PX;
use crate::presence::{DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_PRESENCE_TIMEOUT};
use crate::replica::DEFAULT_MAX_PENDING_POINTS;

/// Default relay endpoint.
pub const DEFAULT_RELAY_URL: &str = "ws://localhost:3030/ws";
/// Default rendezvous endpoint.
pub const DEFAULT_RENDEZVOUS_URL: &str = "ws://localhost:3030/signal";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Settings for one room session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Relay WebSocket URL; `None` disables the relay path.
    pub relay_url: Option<String>,
    /// Rendezvous WebSocket URL; `None` disables the direct mesh path.
    pub rendezvous_url: Option<String>,
    /// Local address direct links are accepted on.
    pub listen_addr: String,
    /// Host:port advertised to other peers (defaults to the bound address).
    pub advertise_addr: Option<String>,
    /// Display label announced through presence.
    pub label: Option<String>,
    pub heartbeat_interval_ms: u64,
    pub presence_timeout_ms: u64,
    pub min_point_distance_px: f64,
    pub max_pending_points: usize,
    /// Outbound frames queued per path before new ones are dropped.
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: Some(DEFAULT_RELAY_URL.to_string()),
            rendezvous_url: Some(DEFAULT_RENDEZVOUS_URL.to_string()),
            listen_addr: "127.0.0.1:0".to_string(),
            advertise_addr: None,
            label: None,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL.as_millis() as u64,
            presence_timeout_ms: DEFAULT_PRESENCE_TIMEOUT.as_millis() as u64,
            min_point_distance_px: DEFAULT_MIN_POINT_DISTANCE_PX,
            max_pending_points: DEFAULT_MAX_PENDING_POINTS,
            outbound_queue: 1024,
        }
    }
}

impl SessionConfig {
    /// Config with both network paths disabled.
    pub fn offline() -> Self {
        Self {
            relay_url: None,
            rendezvous_url: None,
            ..Self::default()
        }
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()
    }

    /// Apply `INKMESH_*` environment overrides.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(v) = lookup("INKMESH_RELAY_URL") {
            self.relay_url = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = lookup("INKMESH_RENDEZVOUS_URL") {
            self.rendezvous_url = (!v.is_empty()).then_some(v);
        }
        if let Some(v) = lookup("INKMESH_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Some(v) = lookup("INKMESH_ADVERTISE_ADDR") {
            self.advertise_addr = Some(v);
        }
        if let Some(v) = lookup("INKMESH_LABEL") {
            self.label = Some(v);
        }
        self.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat_interval_ms",
                value: "0".into(),
            });
        }
        if self.presence_timeout_ms <= self.heartbeat_interval_ms {
            return Err(ConfigError::InvalidValue {
                key: "presence_timeout_ms",
                value: self.presence_timeout_ms.to_string(),
            });
        }
        if !self.min_point_distance_px.is_finite() || self.min_point_distance_px < 0.0 {
            return Err(ConfigError::InvalidValue {
                key: "min_point_distance_px",
                value: self.min_point_distance_px.to_string(),
            });
        }
        if self.outbound_queue == 0 {
            return Err(ConfigError::InvalidValue {
                key: "outbound_queue",
                value: "0".into(),
            });
        }
        Ok(self)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn presence_timeout(&self) -> Duration {
        Duration::from_millis(self.presence_timeout_ms)
    }
}
