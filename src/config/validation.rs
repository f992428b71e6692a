//! Semantic configuration checks.
//!
//! Serde handles the syntactic layer; this module turns the raw schema into
//! resolved [`ConnectorSettings`] — parsed durations, resolved socket
//! addresses — and rejects configurations the connector cannot run with.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use crate::config::schema::ProxyConfig;

/// Sticky-session routing encodes the backend index as a single lowercase
/// letter, which caps the server list.
pub const MAX_STICKY_SERVERS: usize = 26;

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("can't convert {name} ('{value}') to a duration")]
    InvalidDuration { name: String, value: String },

    #[error("invalid backend address '{0}'")]
    InvalidServer(String),

    #[error("no backend servers configured")]
    NoServers,

    #[error("{0} backends configured; sticky sessions support at most {MAX_STICKY_SERVERS}")]
    TooManyServers(usize),
}

/// Resolved, immutable settings shared by the pool and balancer.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub servers: Vec<SocketAddr>,
    /// Configured `host:port` strings, index-aligned with `servers`.
    pub server_names: Vec<String>,
    pub connect_timeout: Duration,
    pub idle_time: Duration,
    pub recover_time: Duration,
    pub socket_timeout: Duration,
    pub keepalive_timeout: Duration,
    pub max_connections: usize,
    pub sticky_sessions: bool,
}

/// Parse a duration string: digits with an optional trailing `s` (seconds)
/// or `m` (minutes), case-insensitive. Bare digits are milliseconds.
pub fn parse_time(name: &str, value: &str) -> Result<Duration, ValidationError> {
    let invalid = || ValidationError::InvalidDuration {
        name: name.to_string(),
        value: value.to_string(),
    };

    if value.is_empty() {
        return Err(invalid());
    }

    let mut millis: u64 = 0;
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next_if(|c| c.is_ascii_digit()) {
        millis = millis
            .checked_mul(10)
            .and_then(|m| m.checked_add(u64::from(c as u8 - b'0')))
            .ok_or_else(invalid)?;
    }

    match chars.next() {
        None => {}
        Some('s') | Some('S') => millis = millis.checked_mul(1000).ok_or_else(invalid)?,
        Some('m') | Some('M') => millis = millis.checked_mul(60 * 1000).ok_or_else(invalid)?,
        Some(_) => return Err(invalid()),
    }

    // A suffix must end the string, and must follow at least one digit.
    if chars.next().is_some() || !value.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid());
    }

    Ok(Duration::from_millis(millis))
}

/// Parse the `host:port[,host:port...]` backend list.
pub fn parse_servers(list: &str) -> Result<(Vec<SocketAddr>, Vec<String>), ValidationError> {
    let mut addrs = Vec::new();
    let mut names = Vec::new();

    for entry in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let addr = entry
            .to_socket_addrs()
            .ok()
            .and_then(|mut it| it.next())
            .ok_or_else(|| ValidationError::InvalidServer(entry.to_string()))?;

        addrs.push(addr);
        names.push(entry.to_string());
    }

    if addrs.is_empty() {
        return Err(ValidationError::NoServers);
    }

    Ok((addrs, names))
}

/// Validate a loaded configuration and produce the resolved settings.
pub fn resolve_settings(config: &ProxyConfig) -> Result<ConnectorSettings, Vec<ValidationError>> {
    let mut errors = Vec::new();
    let c = &config.connector;

    let mut dur = |name: &str, value: &str| match parse_time(name, value) {
        Ok(d) => d,
        Err(e) => {
            errors.push(e);
            Duration::ZERO
        }
    };

    let connect_timeout = dur("connect_timeout", &c.connect_timeout);
    let idle_time = dur("idle_time", &c.idle_time);
    let recover_time = dur("recover_time", &c.recover_time);
    let socket_timeout = dur("socket_timeout", &c.socket_timeout);
    let keepalive_timeout = dur("keepalive_timeout", &c.keepalive_timeout);

    let (servers, server_names) = match parse_servers(&c.servers) {
        Ok(parsed) => parsed,
        Err(e) => {
            errors.push(e);
            (Vec::new(), Vec::new())
        }
    };

    if config.sessions.sticky_sessions && servers.len() > MAX_STICKY_SERVERS {
        errors.push(ValidationError::TooManyServers(servers.len()));
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    Ok(ConnectorSettings {
        servers,
        server_names,
        connect_timeout,
        idle_time,
        recover_time,
        socket_timeout,
        keepalive_timeout,
        max_connections: c.max_connections,
        sticky_sessions: config.sessions.sticky_sessions,
    })
}
