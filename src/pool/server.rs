//! Per-backend connection pool and health tracking.
//!
//! # Responsibilities
//! - Keep a bounded ring of idle connections to one backend address
//! - Enforce the active+starting connection ceiling
//! - Track fail/busy/success timestamps (transient circuit breaker)
//! - Connect with a bounded timeout
//!
//! # Design Decisions
//! - One `Mutex` per server protects both the ring and the health
//!   timestamps; it is never held across an `.await` — `starting_count`
//!   bridges the gap during a connect attempt
//! - Idle connections are reclaimed lazily on `free`, not by a sweeper
//! - After a failure, only one caller probes the backend at a time; others
//!   fail fast instead of stampeding a known-bad server

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::ConnectorSettings;
use crate::pool::connection::HmuxConnection;

/// Fixed capacity of the idle ring.
pub const IDLE_SLOTS: usize = 16;

/// Fixed-capacity LIFO ring of idle connections.
///
/// Pushes and pops happen at the head (most recently freed first); eviction
/// walks from the tail, where the oldest connections sit.
#[derive(Debug, Default)]
struct IdleRing {
    slots: [Option<HmuxConnection>; IDLE_SLOTS],
    head: usize,
    size: usize,
}

impl IdleRing {
    fn is_full(&self) -> bool {
        self.size == IDLE_SLOTS
    }

    fn len(&self) -> usize {
        self.size
    }

    /// Push at the head; gives the connection back if the ring is full.
    fn push(&mut self, conn: HmuxConnection) -> Result<(), HmuxConnection> {
        if self.is_full() {
            return Err(conn);
        }

        self.slots[self.head] = Some(conn);
        self.head = (self.head + 1) % IDLE_SLOTS;
        self.size += 1;
        Ok(())
    }

    /// Pop the most recently pushed connection.
    fn pop(&mut self) -> Option<HmuxConnection> {
        if self.size == 0 {
            return None;
        }

        self.head = (self.head + IDLE_SLOTS - 1) % IDLE_SLOTS;
        self.size -= 1;
        self.slots[self.head].take()
    }

    /// Remove connections older than `idle_time`, oldest first.
    fn evict_expired(
        &mut self,
        now: Instant,
        idle_time: std::time::Duration,
    ) -> Vec<HmuxConnection> {
        let mut evicted = Vec::new();

        while self.size > 0 {
            let tail = (self.head + IDLE_SLOTS - self.size) % IDLE_SLOTS;
            let expired = self.slots[tail]
                .as_ref()
                .map(|c| c.idle_age(now) > idle_time)
                .unwrap_or(true);

            if !expired {
                break;
            }

            if let Some(conn) = self.slots[tail].take() {
                evicted.push(conn);
            }
            self.size -= 1;
        }

        evicted
    }
}

#[derive(Debug, Default)]
struct ServerState {
    ring: IdleRing,
    active_count: usize,
    starting_count: usize,
    fail_time: Option<Instant>,
    busy_time: Option<Instant>,
    success_time: Option<Instant>,
    cpu_load_avg: f64,
}

/// One backend application server: identity, idle pool and health state.
#[derive(Debug)]
pub struct BackendServer {
    name: String,
    addr: SocketAddr,
    index: usize,
    settings: Arc<ConnectorSettings>,
    state: Mutex<ServerState>,
}

impl BackendServer {
    pub fn new(
        name: String,
        addr: SocketAddr,
        index: usize,
        settings: Arc<ConnectorSettings>,
    ) -> Self {
        Self {
            name,
            addr,
            index,
            settings,
            state: Mutex::new(ServerState::default()),
        }
    }

    /// The `host:port` this server was configured with.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Sticky-session letter for this server (`'a' + index`).
    pub fn letter(&self) -> char {
        (b'a' + self.index as u8) as char
    }

    /// Open a connection: recycle first, then health-gated fresh connect.
    pub async fn open(&self) -> Option<HmuxConnection> {
        let now = Instant::now();

        // Recycle the most recently freed connection if it is still warm.
        {
            let mut st = self.state.lock().unwrap();

            if let Some(mut conn) = st.ring.pop() {
                if conn.idle_age(now) <= self.settings.idle_time {
                    conn.mark_active();
                    st.active_count += 1;
                    tracing::debug!(
                        server = %self.name,
                        trace_id = %conn.trace_id(),
                        "recycling pooled connection"
                    );
                    return Some(conn);
                }

                // Stale head means everything behind it is staler; close it
                // and fall through to a fresh connect.
                tracing::debug!(
                    server = %self.name,
                    trace_id = %conn.trace_id(),
                    "idle connection expired"
                );
                drop(conn);
            }

            if self.in_recover_window(&st, now) {
                return None;
            }

            // Another caller is already probing this recently failed server.
            if st.fail_time.is_some() && st.starting_count > 0 {
                return None;
            }

            if st.active_count + st.starting_count >= self.settings.max_connections {
                tracing::warn!(server = %self.name, "connection ceiling reached");
                return None;
            }

            st.starting_count += 1;
        }

        match HmuxConnection::connect(self.addr, self.settings.connect_timeout).await {
            Ok(conn) => {
                let mut st = self.state.lock().unwrap();
                st.starting_count -= 1;
                st.active_count += 1;
                st.fail_time = None;
                Some(conn)
            }
            Err(e) => {
                tracing::warn!(server = %self.name, error = %e, "backend connect failed");
                let mut st = self.state.lock().unwrap();
                st.starting_count -= 1;
                st.fail_time = Some(Instant::now());
                None
            }
        }
    }

    /// Return a connection after a successful exchange.
    ///
    /// Marks success, then parks the connection unless the server is busy or
    /// the ring is full. Finishes by evicting idle connections that sat past
    /// `idle_time`, keeping the pool warm but bounded.
    pub fn free(&self, mut conn: HmuxConnection) {
        let now = Instant::now();
        let mut st = self.state.lock().unwrap();

        st.fail_time = None;
        st.success_time = Some(now);
        st.active_count = st.active_count.saturating_sub(1);

        let busy = st
            .busy_time
            .is_some_and(|t| now.saturating_duration_since(t) < self.settings.recover_time);

        if conn.idle_age(now) == std::time::Duration::ZERO {
            conn.mark_idle_start(now);
        }

        if busy {
            tracing::debug!(server = %self.name, trace_id = %conn.trace_id(), "server busy, closing freed connection");
            drop(conn);
        } else if let Err(conn) = st.ring.push(conn) {
            tracing::debug!(server = %self.name, trace_id = %conn.trace_id(), "idle ring full, closing freed connection");
            drop(conn);
        }

        for stale in st.ring.evict_expired(now, self.settings.idle_time) {
            tracing::debug!(server = %self.name, trace_id = %stale.trace_id(), "evicting expired idle connection");
            drop(stale);
        }
    }

    /// Close a checked-out connection without pooling it.
    pub fn close(&self, conn: HmuxConnection) {
        let mut st = self.state.lock().unwrap();
        st.active_count = st.active_count.saturating_sub(1);
        drop(st);

        tokio::spawn(conn.close());
    }

    /// Transient busy marker; self-clears after `recover_time`.
    pub fn busy(&self) {
        self.state.lock().unwrap().busy_time = Some(Instant::now());
    }

    pub fn clear_busy(&self) {
        self.state.lock().unwrap().busy_time = None;
    }

    /// Socket-level failure marker; self-clears after `recover_time`.
    pub fn fail_socket(&self) {
        self.state.lock().unwrap().fail_time = Some(Instant::now());
    }

    /// cpu-load meta header from the backend; informational only.
    pub fn set_cpu_load(&self, avg: f64) {
        self.state.lock().unwrap().cpu_load_avg = avg;
    }

    pub fn cpu_load(&self) -> f64 {
        self.state.lock().unwrap().cpu_load_avg
    }

    /// Up/down indicator for the status page.
    pub fn is_active(&self) -> bool {
        let st = self.state.lock().unwrap();
        !self.in_recover_window(&st, Instant::now())
    }

    pub fn pooled_count(&self) -> usize {
        self.state.lock().unwrap().ring.len()
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().unwrap().active_count
    }

    /// True while a failure marker is recorded.
    pub fn fail_time_set(&self) -> bool {
        self.state.lock().unwrap().fail_time.is_some()
    }

    fn in_recover_window(&self, st: &ServerState, now: Instant) -> bool {
        let within = |t: Option<Instant>| {
            t.is_some_and(|t| now.saturating_duration_since(t) < self.settings.recover_time)
        };

        within(st.fail_time) || within(st.busy_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn settings() -> Arc<ConnectorSettings> {
        settings_with_idle(Duration::from_secs(5))
    }

    fn settings_with_idle(idle_time: Duration) -> Arc<ConnectorSettings> {
        Arc::new(ConnectorSettings {
            servers: vec!["127.0.0.1:6800".parse().unwrap()],
            server_names: vec!["127.0.0.1:6800".into()],
            connect_timeout: Duration::from_secs(5),
            idle_time,
            recover_time: Duration::from_secs(15),
            socket_timeout: Duration::from_secs(65),
            keepalive_timeout: Duration::from_secs(15),
            max_connections: 8,
            sticky_sessions: true,
        })
    }

    async fn holding_backend() -> std::net::SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else { break };
                // Hold the socket open so the pooled side stays usable.
                tokio::spawn(async move {
                    let _sock = sock;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        });
        addr
    }

    #[test]
    fn ring_starts_empty() {
        let mut ring = IdleRing::default();
        assert_eq!(ring.len(), 0);
        assert!(ring.pop().is_none());
        assert!(!ring.is_full());
    }

    #[tokio::test]
    async fn freed_connection_is_recycled() {
        let addr = holding_backend().await;
        let server = BackendServer::new(addr.to_string(), addr, 0, settings());

        let conn = server.open().await.expect("connect");
        let id = conn.trace_id();
        assert_eq!(server.active_count(), 1);

        server.free(conn);
        assert_eq!(server.active_count(), 0);
        assert_eq!(server.pooled_count(), 1);

        let recycled = server.open().await.expect("recycle");
        assert_eq!(recycled.trace_id(), id);
        assert_eq!(server.pooled_count(), 0);
        assert_eq!(server.active_count(), 1);
    }

    #[tokio::test]
    async fn idle_time_bounds_recycling() {
        let addr = holding_backend().await;
        let server =
            BackendServer::new(addr.to_string(), addr, 0, settings_with_idle(Duration::from_millis(100)));

        // Inside the window: the parked connection comes back.
        let conn = server.open().await.expect("connect");
        let id = conn.trace_id();
        server.free(conn);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let warm = server.open().await.expect("recycle");
        assert_eq!(warm.trace_id(), id);
        server.free(warm);

        // Past the window: the stale head is closed and a fresh connect
        // happens instead.
        tokio::time::sleep(Duration::from_millis(200)).await;
        let fresh = server.open().await.expect("reconnect");
        assert_ne!(fresh.trace_id(), id);
        assert_eq!(server.pooled_count(), 0);
    }

    #[tokio::test]
    async fn free_evicts_expired_idle_connections() {
        let addr = holding_backend().await;
        let server =
            BackendServer::new(addr.to_string(), addr, 0, settings_with_idle(Duration::from_millis(100)));

        let old = server.open().await.expect("connect");
        let old_id = old.trace_id();
        let held = server.open().await.expect("connect");
        let held_id = held.trace_id();

        server.free(old);
        assert_eq!(server.pooled_count(), 1);

        // Let the parked connection expire while the other stays active;
        // freeing it sweeps the stale one from the tail.
        tokio::time::sleep(Duration::from_millis(200)).await;
        server.free(held);
        assert_eq!(server.pooled_count(), 1);

        let recycled = server.open().await.expect("recycle");
        assert_eq!(recycled.trace_id(), held_id);
        assert_ne!(recycled.trace_id(), old_id);
    }

    #[test]
    fn fail_fast_inside_recover_window() {
        let server = BackendServer::new("127.0.0.1:6800".into(), "127.0.0.1:6800".parse().unwrap(), 0, settings());

        server.fail_socket();
        assert!(!server.is_active());
        assert!(server.fail_time_set());
    }

    #[test]
    fn busy_marker_clears() {
        let server = BackendServer::new("127.0.0.1:6800".into(), "127.0.0.1:6800".parse().unwrap(), 0, settings());

        server.busy();
        assert!(!server.is_active());
        server.clear_busy();
        assert!(server.is_active());
    }

    #[test]
    fn letter_maps_index() {
        let server = BackendServer::new("127.0.0.1:6802".into(), "127.0.0.1:6802".parse().unwrap(), 2, settings());
        assert_eq!(server.letter(), 'c');
    }

    #[tokio::test]
    async fn connect_failure_sets_fail_time() {
        // Port 1 on localhost refuses connections.
        let server = BackendServer::new("127.0.0.1:1".into(), "127.0.0.1:1".parse().unwrap(), 0, settings());

        assert!(server.open().await.is_none());
        assert!(server.fail_time_set());

        // Second caller fails fast without a connect attempt.
        assert!(server.open().await.is_none());
    }
}
