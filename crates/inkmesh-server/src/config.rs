//! Server configuration from the environment.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `INKMESH_BIND` | `0.0.0.0:3030` |
//! | `INKMESH_HISTORY` | `512` |
//! | `INKMESH_HISTORY_BYTES` | `8388608` |
//! | `INKMESH_CHANNEL_CAPACITY` | `256` |

use std::net::SocketAddr;

use crate::error::ServerError;

pub const DEFAULT_BIND: &str = "0.0.0.0:3030";
/// Payloads kept per room for late joiners.
pub const DEFAULT_HISTORY: usize = 512;
/// Payload bytes kept per room for late joiners.
pub const DEFAULT_HISTORY_BYTES: usize = 8 * 1024 * 1024;
/// Fan-out buffer per room.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub history_limit: usize,
    pub history_bytes: usize,
    pub channel_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3030)),
            history_limit: DEFAULT_HISTORY,
            history_bytes: DEFAULT_HISTORY_BYTES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `INKMESH_*` variables.
    pub fn from_env() -> Result<Self, ServerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ServerError> {
        let mut config = Self::default();
        if let Some(bind) = lookup("INKMESH_BIND") {
            config.bind = parse("INKMESH_BIND", &bind)?;
        }
        if let Some(history) = lookup("INKMESH_HISTORY") {
            config.history_limit = parse("INKMESH_HISTORY", &history)?;
        }
        if let Some(bytes) = lookup("INKMESH_HISTORY_BYTES") {
            config.history_bytes = parse("INKMESH_HISTORY_BYTES", &bytes)?;
        }
        if let Some(capacity) = lookup("INKMESH_CHANNEL_CAPACITY") {
            config.channel_capacity = parse("INKMESH_CHANNEL_CAPACITY", &capacity)?;
            if config.channel_capacity == 0 {
                return Err(ServerError::Config {
                    key: "INKMESH_CHANNEL_CAPACITY",
                    value: capacity,
                });
            }
        }
        Ok(config)
    }
}

fn parse<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, ServerError> {
    value.trim().parse().map_err(|_| ServerError::Config {
        key,
        value: value.to_string(),
    })
}
