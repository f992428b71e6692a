//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML. Durations
//! are written as strings with `s` (seconds) or `m` (minutes) suffixes;
//! bare digits mean milliseconds. Defaults mirror a conventional app-tier
//! deployment: connect 5s, idle 5s, recover 15s, socket 65s.

use serde::{Deserialize, Serialize};

/// Root configuration for the connector.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Front-end listener settings.
    pub listener: ListenerConfig,

    /// Backend pool and timeout settings.
    pub connector: ConnectorConfig,

    /// Sticky-session settings.
    pub sessions: SessionConfig,

    /// Diagnostics page settings.
    pub status: StatusConfig,
}

/// Front-end listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self { bind_address: "0.0.0.0:8080".to_string() }
    }
}

/// Backend pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectorConfig {
    /// Comma-separated backend list: `host:port[,host:port...]`.
    pub servers: String,

    /// Connect attempt bound.
    pub connect_timeout: String,

    /// Maximum age of a pooled idle connection.
    pub idle_time: String,

    /// How long a fail/busy marker keeps a server out of rotation.
    pub recover_time: String,

    /// Read bound during a framed exchange.
    pub socket_timeout: String,

    /// Backend keepalive window (reported on the status page).
    pub keepalive_timeout: String,

    /// Ceiling on active + starting connections per backend.
    pub max_connections: usize,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            servers: "127.0.0.1:6800".to_string(),
            connect_timeout: "5s".to_string(),
            idle_time: "5s".to_string(),
            recover_time: "15s".to_string(),
            socket_timeout: "65s".to_string(),
            keepalive_timeout: "15s".to_string(),
            max_connections: 64,
        }
    }
}

/// Sticky-session configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Pin requests to the backend encoded in their session id.
    pub sticky_sessions: bool,

    /// Session cookie name.
    pub cookie_name: String,

    /// Session cookie name on secure connections.
    pub ssl_cookie_name: String,

    /// URL-rewrite marker preceding the session id in the path.
    pub url_prefix: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sticky_sessions: true,
            cookie_name: "JSESSIONID".to_string(),
            ssl_cookie_name: "SSLJSESSIONID".to_string(),
            url_prefix: ";jsessionid=".to_string(),
        }
    }
}

/// Diagnostics page configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatusConfig {
    /// Serve the human-readable status page.
    pub enabled: bool,

    /// Path the status page is mounted on.
    pub path: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self { enabled: true, path: "/hmux-status".to_string() }
    }
}
