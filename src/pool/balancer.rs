//! Backend selection: sticky sessions, round-robin and failover.
//!
//! # Responsibilities
//! - Map session ids to their pinned backend
//! - Rotate across backends under a cursor lock
//! - Probe every remaining backend once when the first choice fails
//!
//! # Design Decisions
//! - The cursor advances even when the probe fails, so a bad server does
//!   not pin the rotation
//! - After a failure the probe restarts from a random index, spreading
//!   failover load across the surviving servers

use std::sync::{Arc, Mutex};

use crate::config::ConnectorSettings;
use crate::pool::connection::HmuxConnection;
use crate::pool::server::BackendServer;

/// A checked-out connection together with its owning server, so the caller
/// can report the outcome (`free`/`close`/`busy`/`fail_socket`) to the
/// right place.
#[derive(Debug)]
pub struct Checkout {
    pub server: Arc<BackendServer>,
    pub conn: HmuxConnection,
}

/// Owns the backend array and the shared rotation cursor.
#[derive(Debug)]
pub struct LoadBalancer {
    servers: Vec<Arc<BackendServer>>,
    cursor: Mutex<usize>,
    sticky_sessions: bool,
}

impl LoadBalancer {
    pub fn new(settings: Arc<ConnectorSettings>) -> Self {
        let servers = settings
            .servers
            .iter()
            .zip(settings.server_names.iter())
            .enumerate()
            .map(|(i, (addr, name))| {
                Arc::new(BackendServer::new(name.clone(), *addr, i, settings.clone()))
            })
            .collect();

        Self {
            servers,
            cursor: Mutex::new(0),
            sticky_sessions: settings.sticky_sessions,
        }
    }

    pub fn servers(&self) -> &[Arc<BackendServer>] {
        &self.servers
    }

    /// Open a connection to some backend.
    ///
    /// Sticky lookup first when a session id is present, then round-robin
    /// with a one-pass random-start probe on failure. `exclude` is skipped
    /// during a failover attempt. Returns `None` only when every candidate
    /// failed.
    pub async fn open_server(
        &self,
        session_id: Option<&str>,
        exclude: Option<&Arc<BackendServer>>,
    ) -> Option<Checkout> {
        if self.servers.is_empty() {
            return None;
        }

        if self.sticky_sessions {
            if let Some(index) = session_id.and_then(|sid| self.sticky_index(sid)) {
                let server = &self.servers[index];
                tracing::debug!(server = %server.name(), "sticky session lookup");

                if let Some(conn) = server.open().await {
                    return Some(Checkout { server: server.clone(), conn });
                }
                // Sticky target unavailable: fall through to rotation.
            }
        }

        let len = self.servers.len();

        let first = {
            let mut cursor = self.cursor.lock().unwrap();
            let index = *cursor % len;
            *cursor = (index + 1) % len;
            index
        };

        if !Self::is_excluded(&self.servers[first], exclude) {
            if let Some(conn) = self.servers[first].open().await {
                return Some(Checkout { server: self.servers[first].clone(), conn });
            }
        }

        // First choice failed: reseed and probe every remaining server once.
        let start = fastrand::usize(..len);
        {
            *self.cursor.lock().unwrap() = start;
        }

        for i in 0..len {
            let index = (start + i) % len;
            if index == first {
                continue;
            }

            let server = &self.servers[index];
            if Self::is_excluded(server, exclude) {
                continue;
            }

            {
                let mut cursor = self.cursor.lock().unwrap();
                *cursor = (index + 1) % len;
            }

            if let Some(conn) = server.open().await {
                return Some(Checkout { server: server.clone(), conn });
            }
        }

        None
    }

    /// Map the first byte of the session id (`'a' + index`) to a server.
    /// Single lowercase letters only, which caps a deployment at 26
    /// backends; that limit comes with the session-id format.
    fn sticky_index(&self, session_id: &str) -> Option<usize> {
        let first = session_id.bytes().next()?;

        if !first.is_ascii_lowercase() {
            return None;
        }

        let index = (first - b'a') as usize;
        (index < self.servers.len()).then_some(index)
    }

    fn is_excluded(server: &Arc<BackendServer>, exclude: Option<&Arc<BackendServer>>) -> bool {
        exclude.is_some_and(|ex| Arc::ptr_eq(server, ex))
    }
}
