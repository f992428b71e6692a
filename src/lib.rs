//! HMUX reverse-proxy connector library.
//!
//! Forwards HTTP requests to backend app servers over the HMUX binary
//! protocol, with per-backend connection pooling, sticky sessions,
//! round-robin rotation and bounded failover.

pub mod config;
pub mod hmux;
pub mod pool;
pub mod proxy;

pub use config::{load_config, resolve_settings, ConnectorSettings, ProxyConfig};
pub use pool::LoadBalancer;
pub use proxy::{build_router, AppState};
