//! The proxy entry point.
//!
//! # Responsibilities
//! - Buffer the request body prefix and decide whether it is complete
//! - Obtain a connection from the load balancer
//! - Delegate the exchange to the protocol engine
//! - Retry exactly once against a different backend on BUSY/FAIL
//! - Emit the static 503 page when every backend is exhausted
//!
//! Per-request state machine:
//! `SELECT_BACKEND → FIRST_ATTEMPT → (DONE | FAILOVER_ATTEMPT → DONE)`.
//! The first attempt treats a 503 as retryable only while the request body
//! is fully buffered and replayable; the failover attempt never does, so
//! total attempts are bounded at two.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderName, HeaderValue, Method, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{any, get};
use axum::Router;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tower_http::trace::TraceLayer;

use crate::config::{ConnectorSettings, ProxyConfig};
use crate::hmux::engine::{ProtocolEngine, RequestHead, CHUNK_SIZE};
use crate::hmux::{ExchangeStatus, HmuxError};
use crate::pool::{Checkout, LoadBalancer};
use crate::proxy::session;
use crate::proxy::status;
use crate::proxy::surface::{CacheDirective, ClientResponse, RequestBody};

/// Shared state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub balancer: Arc<LoadBalancer>,
    pub settings: Arc<ConnectorSettings>,
    pub config: Arc<ProxyConfig>,
}

/// Build the front-end router: the status page (when enabled) plus a
/// catch-all that forwards everything else.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new();

    if state.config.status.enabled {
        router = router.route(&state.config.status.path, get(status::status_page));
    }

    router
        .route("/", any(proxy_handler))
        .route("/{*path}", any(proxy_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Forward one inbound request over HMUX.
async fn proxy_handler(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    request: Request<Body>,
) -> axum::response::Response {
    let session_id = if state.config.sessions.sticky_sessions {
        session::requested_session_id(
            request.uri().path(),
            request.headers(),
            false,
            &state.config.sessions,
        )
    } else {
        None
    };

    let head = request_head(&request, remote);
    let method = request.method().clone();

    let (first_chunk, is_complete, stream) = match buffer_body_prefix(request).await {
        Ok(buffered) => buffered,
        Err(_) => {
            tracing::info!("client disconnected while sending the request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    let (head_tx, head_rx) = oneshot::channel();
    let (body_tx, body_rx) = mpsc::channel::<Bytes>(8);

    let channel = ClientChannel { head_tx: Some(head_tx), body_tx };

    tokio::spawn(run_attempts(
        state,
        session_id,
        method,
        head,
        first_chunk,
        is_complete,
        stream,
        channel,
    ));

    let Ok(committed) = head_rx.await else {
        // The exchange task went away without committing anything.
        return StatusCode::BAD_GATEWAY.into_response();
    };

    let mut builder = Response::builder().status(committed.status);
    for (name, value) in &committed.headers {
        let Ok(name) = HeaderName::try_from(name.as_str()) else { continue };
        let Ok(value) = HeaderValue::try_from(value.as_str()) else { continue };
        builder = builder.header(name, value);
    }

    let body = Body::from_stream(futures_util::stream::unfold(body_rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok::<_, Infallible>(chunk), rx))
    }));

    builder.body(body).unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response())
}

/// The 2-attempt state machine, run apart from the client response so data
/// can stream while the exchange is still in flight.
#[allow(clippy::too_many_arguments)]
async fn run_attempts(
    state: AppState,
    session_id: Option<String>,
    method: Method,
    head: RequestHead,
    first_chunk: Bytes,
    is_complete: bool,
    stream: BodyStream,
    mut channel: ClientChannel,
) {
    let mut body = StreamingBody { stream };

    // A busy response is only worth swallowing when the request can actually
    // be replayed: the whole body must still be in hand. A partially consumed
    // body cannot fail over, so the backend's own 503 is relayed instead.
    let Some(checkout) = state.balancer.open_server(session_id.as_deref(), None).await else {
        send_unavailable(&mut channel).await;
        return;
    };

    let first_server = checkout.server.clone();
    let status = match attempt(&state, checkout, &head, &first_chunk, is_complete, &mut body, &mut channel, is_complete).await {
        AttemptEnd::Done => return,
        AttemptEnd::ClientGone => return,
        AttemptEnd::Retryable(status) => status,
    };

    let retry = (is_complete && status == ExchangeStatus::Busy) || method == Method::GET;
    if !retry {
        send_unavailable(&mut channel).await;
        return;
    }

    // Failover: one more attempt against a different backend, no busy-retry.
    let Some(checkout) = state
        .balancer
        .open_server(session_id.as_deref(), Some(&first_server))
        .await
    else {
        tracing::info!(failed = %first_server.name(), "load balance failed");
        send_unavailable(&mut channel).await;
        return;
    };

    tracing::info!(
        from = %first_server.name(),
        to = %checkout.server.name(),
        "load balance failing over"
    );

    match attempt(&state, checkout, &head, &first_chunk, is_complete, &mut body, &mut channel, false).await {
        AttemptEnd::Done | AttemptEnd::ClientGone => {}
        AttemptEnd::Retryable(_) => send_unavailable(&mut channel).await,
    }
}

enum AttemptEnd {
    /// Response fully relayed.
    Done,
    /// Client disconnect: clean abort, no failover.
    ClientGone,
    /// BUSY or FAIL; the caller decides whether to fail over.
    Retryable(ExchangeStatus),
}

#[allow(clippy::too_many_arguments)]
async fn attempt(
    state: &AppState,
    checkout: Checkout,
    head: &RequestHead,
    first_chunk: &[u8],
    is_complete: bool,
    body: &mut StreamingBody,
    channel: &mut ClientChannel,
    allow_busy: bool,
) -> AttemptEnd {
    let Checkout { server, mut conn } = checkout;
    let trace_id = conn.trace_id();
    let mut response = ChannelResponse::new(channel);

    let run = {
        let mut engine = ProtocolEngine::new(
            conn.stream_mut(),
            &server,
            trace_id,
            state.settings.socket_timeout,
        );
        engine
            .run(head, first_chunk, is_complete, body, &mut response, allow_busy)
            .await
    };

    match run {
        Ok(result) => {
            conn.mark_idle_start(result.idle_since);

            if result.outcome.keep_alive() {
                server.free(conn);
            } else {
                server.close(conn);
            }

            match result.outcome.status {
                ExchangeStatus::Ok => {
                    server.clear_busy();
                    response.finish().await;
                    AttemptEnd::Done
                }
                ExchangeStatus::Busy => {
                    server.busy();
                    AttemptEnd::Retryable(ExchangeStatus::Busy)
                }
                ExchangeStatus::Fail => {
                    server.fail_socket();
                    AttemptEnd::Retryable(ExchangeStatus::Fail)
                }
            }
        }
        Err(HmuxError::ClientDisconnect) => {
            tracing::info!(trace_id = %trace_id, "client disconnect detected");
            server.close(conn);
            AttemptEnd::ClientGone
        }
        Err(e) => {
            tracing::warn!(trace_id = %trace_id, error = %e, "exchange failed");
            server.fail_socket();
            server.close(conn);
            AttemptEnd::Retryable(ExchangeStatus::Fail)
        }
    }
}

/// Build the protocol-level view of the inbound request.
fn request_head(request: &Request<Body>, remote: SocketAddr) -> RequestHead {
    let uri = request.uri();

    let host = request
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");
    let server_port = host.rsplit_once(':').map(|(_, p)| p).unwrap_or("80");

    let headers = request
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value.to_str().ok().map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    RequestHead {
        method: request.method().as_str().to_string(),
        uri: uri.path().to_string(),
        query: uri.query().map(|q| q.to_string()),
        protocol: format!("{:?}", request.version()),
        server_name: host.to_string(),
        server_port: server_port.to_string(),
        remote_addr: remote.ip().to_string(),
        remote_host: remote.ip().to_string(),
        headers,
        // This front end terminates plain HTTP; embedders that sit behind a
        // TLS listener populate these through the same head.
        is_secure: false,
        key_size: None,
        client_cert: None,
    }
}

type BodyStream = futures_util::stream::BoxStream<'static, Result<Bytes, axum::Error>>;

/// Buffer up to one chunk of the body and learn whether that was all of it.
async fn buffer_body_prefix(
    request: Request<Body>,
) -> Result<(Bytes, bool, BodyStream), axum::Error> {
    let mut stream = request.into_body().into_data_stream().boxed();

    let mut buffered = BytesMut::new();
    let mut is_complete = false;

    while buffered.len() < CHUNK_SIZE {
        match stream.next().await {
            None => {
                is_complete = true;
                break;
            }
            Some(Ok(chunk)) => buffered.extend_from_slice(&chunk),
            Some(Err(e)) => return Err(e),
        }
    }

    Ok((buffered.freeze(), is_complete, stream))
}

/// Pulls the rest of the client body during the backpressure handshake.
struct StreamingBody {
    stream: BodyStream,
}

impl RequestBody for StreamingBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, HmuxError> {
        match self.stream.next().await {
            None => Ok(None),
            Some(Ok(chunk)) => Ok(Some(chunk)),
            Some(Err(_)) => Err(HmuxError::ClientDisconnect),
        }
    }
}

/// Response head committed to the client exactly once.
struct CommittedHead {
    status: u16,
    headers: Vec<(String, String)>,
}

/// The one-shot head channel plus the streaming body channel shared by both
/// attempts. The head is consumed by whichever attempt first writes data.
struct ClientChannel {
    head_tx: Option<oneshot::Sender<CommittedHead>>,
    body_tx: mpsc::Sender<Bytes>,
}

/// Per-attempt [`ClientResponse`] implementation. Status and headers
/// accumulate locally until the first body write commits them, so a busy
/// attempt that never writes leaves the client untouched for the failover.
struct ChannelResponse<'a> {
    channel: &'a mut ClientChannel,
    status: u16,
    headers: Vec<(String, String)>,
}

impl<'a> ChannelResponse<'a> {
    fn new(channel: &'a mut ClientChannel) -> Self {
        Self { channel, status: 200, headers: Vec::new() }
    }

    fn commit_head(&mut self) {
        if let Some(tx) = self.channel.head_tx.take() {
            let head = CommittedHead {
                status: self.status,
                headers: std::mem::take(&mut self.headers),
            };
            // A drop on the other side surfaces later as a body-write error.
            let _ = tx.send(head);
        }
    }

    /// Commit the head even when the response had no body.
    async fn finish(&mut self) {
        self.commit_head();
    }
}

impl ClientResponse for ChannelResponse<'_> {
    fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    fn header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn content_type(&mut self, value: &str, _charset: Option<&str>) {
        // The charset is already embedded in the raw value; surfaces with a
        // separate encoding API consume the extracted parameter instead.
        self.headers.push((header::CONTENT_TYPE.to_string(), value.to_string()));
    }

    fn cache_control(&mut self, directives: &[CacheDirective]) {
        let value = directives
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ");

        if !value.is_empty() {
            self.headers.push((header::CACHE_CONTROL.to_string(), value));
        }
    }

    async fn write(&mut self, data: Bytes) -> Result<(), HmuxError> {
        self.commit_head();

        self.channel
            .body_tx
            .send(data)
            .await
            .map_err(|_| HmuxError::ClientDisconnect)
    }
}

/// Static page served when every attempt failed.
const UNAVAILABLE_PAGE: &str = "<html>\n\
<head><title>503 Service Temporarily Unavailable</title></head>\n\
<body>\n\
<h1>503 Service Temporarily Unavailable</h1>\n\
<p /><hr />\n\
</body></html>\n";

async fn send_unavailable(channel: &mut ClientChannel) {
    if let Some(tx) = channel.head_tx.take() {
        let head = CommittedHead {
            status: StatusCode::SERVICE_UNAVAILABLE.as_u16(),
            headers: vec![(header::CONTENT_TYPE.to_string(), "text/html".to_string())],
        };

        if tx.send(head).is_ok() {
            let _ = channel.body_tx.send(Bytes::from_static(UNAVAILABLE_PAGE.as_bytes())).await;
        }
    }
    // Head already committed: the first attempt streamed data before
    // failing. Nothing more can be done; the body channel closes on drop.
}
