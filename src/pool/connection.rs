//! A single pooled backend connection.
//!
//! # Responsibilities
//! - Own exactly one socket to one backend
//! - Generate unique trace ids for log correlation
//! - Track idle age for pool eviction decisions
//!
//! A connection is either checked out by one request, parked in exactly one
//! server's idle ring, or dropped. Never more than one of these.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;

use crate::hmux::HmuxError;

/// Global counter for trace ids. Relaxed ordering is sufficient: only
/// uniqueness matters, not synchronization.
static TRACE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier for one backend connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TraceId(u64);

impl TraceId {
    pub fn new() -> Self {
        Self(TRACE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TraceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hmux-{}", self.0)
    }
}

/// One socket to one backend, buffered in both directions.
#[derive(Debug)]
pub struct HmuxConnection {
    stream: BufStream<TcpStream>,
    trace_id: TraceId,
    /// Set while the connection sits in an idle ring; `None` while active.
    idle_since: Option<Instant>,
}

impl HmuxConnection {
    /// Connect to `addr`, bounded by `connect_timeout`.
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self, HmuxError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| HmuxError::ConnectTimeout)??;

        stream.set_nodelay(true)?;

        let conn = Self {
            stream: BufStream::new(stream),
            trace_id: TraceId::new(),
            idle_since: None,
        };

        tracing::debug!(trace_id = %conn.trace_id, %addr, "backend connection opened");

        Ok(conn)
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    /// The buffered socket stream; the protocol engine reads and writes here.
    pub fn stream_mut(&mut self) -> &mut BufStream<TcpStream> {
        &mut self.stream
    }

    /// Restart the idle clock. Called when the connection is parked and also
    /// at the first post-QUIT read, so a slow client draining the response
    /// does not eat into the backend's keepalive window.
    pub fn mark_idle_start(&mut self, now: Instant) {
        self.idle_since = Some(now);
    }

    pub fn mark_active(&mut self) {
        self.idle_since = None;
    }

    /// Time spent idle, or zero while active.
    pub fn idle_age(&self, now: Instant) -> Duration {
        self.idle_since
            .map(|since| now.saturating_duration_since(since))
            .unwrap_or(Duration::ZERO)
    }

    /// Best-effort shutdown; the socket closes on drop regardless.
    pub async fn close(mut self) {
        tracing::debug!(trace_id = %self.trace_id, "backend connection closed");
        let _ = self.stream.shutdown().await;
    }
}
