//! Shared utilities for integration testing: a scriptable mock backend that
//! speaks the HMUX framing, and a helper that boots the full proxy in-process.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use hmux_proxy::config::ProxyConfig;
use hmux_proxy::hmux::codes;
use hmux_proxy::proxy::{build_router, AppState};
use hmux_proxy::LoadBalancer;

/// What the mock backend sends back for each exchange.
#[derive(Debug, Clone)]
pub enum Script {
    /// Status, headers, body, then QUIT (connection stays reusable).
    Respond {
        status: &'static str,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    },
    /// 503 plus an apology body, then EXIT.
    Busy,
    /// Close the socket without writing anything.
    Hangup,
}

/// One tuple read off the wire, for assertions on what the proxy sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    Tuple(u8, Vec<u8>),
    Control(u8),
}

pub struct MockBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicUsize>,
    pub received: mpsc::UnboundedReceiver<Received>,
}

impl MockBackend {
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Drain everything recorded so far.
    pub fn drain_received(&mut self) -> Vec<Received> {
        let mut out = Vec::new();
        while let Ok(item) = self.received.try_recv() {
            out.push(item);
        }
        out
    }
}

/// Start a backend that plays `script` for every exchange, on every
/// connection, until the test ends.
pub async fn spawn_backend(script: Script) -> MockBackend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::unbounded_channel();

    let conn_counter = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((socket, _)) = listener.accept().await else { break };
            conn_counter.fetch_add(1, Ordering::SeqCst);

            let script = script.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut stream = BufStream::new(socket);
                // Sequential exchanges over one keepalive connection.
                while serve_exchange(&mut stream, &script, &tx).await {}
            });
        }
    });

    MockBackend { addr, connections, received: rx }
}

/// Read one framed request, then play the script. Returns false when the
/// connection should not serve another exchange.
async fn serve_exchange(
    stream: &mut BufStream<TcpStream>,
    script: &Script,
    tx: &mpsc::UnboundedSender<Received>,
) -> bool {
    loop {
        let code = match stream.read_u8().await {
            Ok(code) => code,
            Err(_) => return false,
        };

        match code {
            codes::HMUX_QUIT => {
                let _ = tx.send(Received::Control(code));
                break;
            }
            codes::HMUX_EXIT => {
                let _ = tx.send(Received::Control(code));
                return false;
            }
            codes::HMUX_YIELD => {
                let _ = tx.send(Received::Control(code));
                // Acknowledge so the proxy keeps streaming.
                if stream.write_u8(codes::HMUX_ACK).await.is_err() {
                    return false;
                }
                if stream.flush().await.is_err() {
                    return false;
                }
            }
            _ => {
                let Ok(len) = stream.read_u16().await else { return false };
                let mut payload = vec![0u8; len as usize];
                if stream.read_exact(&mut payload).await.is_err() {
                    return false;
                }
                let _ = tx.send(Received::Tuple(code, payload));
            }
        }
    }

    match script {
        Script::Respond { status, headers, body } => {
            if write_tuple(stream, codes::HMUX_STATUS, status.as_bytes()).await.is_err() {
                return false;
            }
            for (name, value) in headers {
                let _ = write_tuple(stream, codes::HMUX_HEADER, name.as_bytes()).await;
                let _ = write_tuple(stream, codes::HMUX_STRING, value.as_bytes()).await;
            }
            if !body.is_empty() {
                let _ = write_tuple(stream, codes::HMUX_DATA, body.as_bytes()).await;
            }
            let _ = stream.write_u8(codes::HMUX_QUIT).await;
            stream.flush().await.is_ok()
        }
        Script::Busy => {
            let _ = write_tuple(stream, codes::HMUX_STATUS, b"503").await;
            let _ = write_tuple(stream, codes::HMUX_DATA, b"try again later").await;
            let _ = stream.write_u8(codes::HMUX_EXIT).await;
            let _ = stream.flush().await;
            false
        }
        Script::Hangup => false,
    }
}

async fn write_tuple(
    stream: &mut BufStream<TcpStream>,
    code: u8,
    payload: &[u8],
) -> std::io::Result<()> {
    stream.write_u8(code).await?;
    stream.write_u16(payload.len() as u16).await?;
    stream.write_all(payload).await
}

/// Boot the proxy against the given backends; returns its base URL.
pub async fn spawn_proxy(backends: &[SocketAddr]) -> String {
    let mut config = ProxyConfig::default();
    config.connector.servers =
        backends.iter().map(|a| a.to_string()).collect::<Vec<_>>().join(",");
    config.connector.connect_timeout = "500".to_string();
    config.connector.socket_timeout = "5s".to_string();

    let settings =
        Arc::new(hmux_proxy::resolve_settings(&config).expect("valid test configuration"));
    let balancer = Arc::new(LoadBalancer::new(settings.clone()));

    let state = AppState { balancer, settings, config: Arc::new(config) };
    let router = build_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    format!("http://{addr}")
}
