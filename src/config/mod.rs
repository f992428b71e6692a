//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks, duration/address resolution)
//!     → ConnectorSettings (validated, immutable)
//!     → shared via Arc with the pool and balancer
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; pool and health state are in-memory
//!   and rebuilt on start
//! - All fields have defaults so a minimal config runs
//! - Durations are strings with `s`/`m` suffixes, matching the original
//!   connector's configuration surface

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{ConnectorConfig, ListenerConfig, ProxyConfig, SessionConfig, StatusConfig};
pub use validation::{parse_time, resolve_settings, ConnectorSettings, ValidationError};
