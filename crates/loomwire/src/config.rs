//! Server and client configuration.
//!
//! Both structs load from JSON; every field is optional and falls back
//! to its default:
//!
//! ```json
//! {
//!   "bind_address": "0.0.0.0:4000",
//!   "max_connections": 500,
//!   "personality": { "mode": "synchronous" }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use loomwire_session::Personality;
use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

const MIN_TIMEOUT_MS: u64 = 100;

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

/// Settings for a [`NetServer`](crate::NetServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Where the TCP listener binds.
    pub bind_address: String,
    /// Connections beyond this are refused with `MaxConnReached`.
    /// Counted from accept, handshakes in progress included.
    pub max_connections: usize,
    /// Version clients must present.
    pub protocol_version: u32,
    /// How long a client has to send its registration.
    pub handshake_timeout_ms: u64,
    /// Personality activated on every accepted connection.
    pub personality: Personality,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:4000".to_string(),
            max_connections: 200,
            protocol_version: PROTOCOL_VERSION,
            handshake_timeout_ms: 10_000,
            personality: Personality::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str::<Self>(text)?.validated())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(read_json::<Self>(path.as_ref())?.validated())
    }

    /// Clamps values that cannot work.
    pub fn validated(mut self) -> Self {
        if self.max_connections == 0 {
            tracing::warn!("max_connections of 0 raised to 1");
            self.max_connections = 1;
        }
        self.handshake_timeout_ms = self.handshake_timeout_ms.max(MIN_TIMEOUT_MS);
        self
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Settings for a [`NetClient`](crate::NetClient).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub protocol_version: u32,
    /// Bound on opening the stream.
    pub connect_timeout_ms: u64,
    /// Bound from registration sent to welcome or error received.
    pub handshake_timeout_ms: u64,
    /// Personality activated once the server welcomes us.
    pub personality: Personality,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            connect_timeout_ms: 10_000,
            handshake_timeout_ms: 10_000,
            personality: Personality::default(),
        }
    }
}

impl ClientConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str::<Self>(text)?.validated())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(read_json::<Self>(path.as_ref())?.validated())
    }

    pub fn validated(mut self) -> Self {
        self.connect_timeout_ms = self.connect_timeout_ms.max(MIN_TIMEOUT_MS);
        self.handshake_timeout_ms = self.handshake_timeout_ms.max(MIN_TIMEOUT_MS);
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.max_connections, 200);
        assert_eq!(cfg.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.protocol_version, PROTOCOL_VERSION);
        assert_eq!(cfg.personality, Personality::default());
    }

    #[test]
    fn test_server_partial_json_keeps_defaults() {
        let cfg = ServerConfig::from_json_str(
            r#"{"max_connections": 3, "personality": {"mode": "synchronous"}}"#,
        )
        .unwrap();
        assert_eq!(cfg.max_connections, 3);
        assert_eq!(cfg.bind_address, "127.0.0.1:4000");
        assert!(cfg.personality.is_synchronous());
    }

    #[test]
    fn test_server_validated_clamps() {
        let cfg = ServerConfig::from_json_str(r#"{"max_connections": 0, "handshake_timeout_ms": 1}"#)
            .unwrap();
        assert_eq!(cfg.max_connections, 1);
        assert_eq!(cfg.handshake_timeout_ms, MIN_TIMEOUT_MS);
    }

    #[test]
    fn test_client_bad_json_is_parse_error() {
        let err = ClientConfig::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_client_missing_file_is_read_error() {
        let err = ClientConfig::from_json_file("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_client_json_round_trip() {
        let cfg = ClientConfig {
            connect_timeout_ms: 2_500,
            ..ClientConfig::default()
        };
        let text = serde_json::to_string(&cfg).unwrap();
        assert_eq!(ClientConfig::from_json_str(&text).unwrap(), cfg);
    }
}
