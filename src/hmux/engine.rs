//! The HMUX request/response state machine.
//!
//! One engine drives one exchange: it writes the framed request, streams
//! body chunks through the YIELD/ACK backpressure handshake, then consumes
//! the framed response and relays it to the client.
//!
//! # Design Decisions
//! - The handshake is a synchronous state machine with a timeout on every
//!   read; there is no pipelining — one exchange fully owns its connection
//! - Backend-facing failures become an [`Outcome`] or an [`HmuxError`] at
//!   this boundary; nothing propagates past the entry point as a panic

use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::hmux::codes;
use crate::hmux::wire;
use crate::hmux::{Disposition, ExchangeStatus, HmuxError, Outcome};
use crate::pool::server::BackendServer;
use crate::pool::TraceId;
use crate::proxy::surface::{CacheDirective, ClientResponse, RequestBody};

/// Marker sent as the server type field.
const SERVER_TYPE: &str = "Hyper";

/// Largest DATA payload written per tuple. The length prefix is 16 bits;
/// staying at the request buffer size keeps frames uniform.
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Everything about the inbound request the engine forwards, already parsed
/// by the embedding front end.
#[derive(Debug, Clone, Default)]
pub struct RequestHead {
    pub method: String,
    /// Escaped request path, no query string.
    pub uri: String,
    pub query: Option<String>,
    /// e.g. "HTTP/1.1".
    pub protocol: String,
    /// `host:port` the client addressed.
    pub server_name: String,
    pub server_port: String,
    pub remote_addr: String,
    pub remote_host: String,
    pub headers: Vec<(String, String)>,
    pub is_secure: bool,
    /// TLS key size, sent as a synthetic header on secure requests.
    pub key_size: Option<u32>,
    /// DER-encoded client certificate, sent as a raw binary tuple.
    pub client_cert: Option<Bytes>,
}

/// Result of one exchange attempt.
#[derive(Debug)]
pub struct ExchangeResult {
    pub outcome: Outcome,
    /// When the connection went quiet, recorded at the QUIT write so a slow
    /// client draining the response does not eat the keepalive window.
    pub idle_since: Instant,
}

/// Drives one exchange over one backend connection.
pub struct ProtocolEngine<'a, S> {
    stream: &'a mut S,
    server: &'a BackendServer,
    trace_id: TraceId,
    socket_timeout: Duration,
}

impl<'a, S> ProtocolEngine<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(
        stream: &'a mut S,
        server: &'a BackendServer,
        trace_id: TraceId,
        socket_timeout: Duration,
    ) -> Self {
        Self { stream, server, trace_id, socket_timeout }
    }

    /// Run the full request/response cycle.
    ///
    /// `first_chunk` is the already-buffered body prefix; `is_complete`
    /// means there is nothing left to pull from `body`. `allow_busy` marks
    /// a 503 as retryable; callers grant it only on a first attempt whose
    /// body can still be replayed.
    pub async fn run<B, R>(
        &mut self,
        head: &RequestHead,
        first_chunk: &[u8],
        is_complete: bool,
        body: &mut B,
        response: &mut R,
        allow_busy: bool,
    ) -> Result<ExchangeResult, HmuxError>
    where
        B: RequestBody + Send,
        R: ClientResponse + Send,
    {
        self.write_head(head).await?;

        let mut has_header = true;
        let mut has_status = false;

        if !first_chunk.is_empty() {
            tracing::trace!(trace_id = %self.trace_id, len = first_chunk.len(), ">>D: data");
            self.write_data(first_chunk).await?;
        }

        if !is_complete {
            loop {
                let Some(chunk) = body.next_chunk().await? else {
                    break;
                };

                tracing::trace!(trace_id = %self.trace_id, len = chunk.len(), ">>D: data");
                self.write_data(&chunk).await?;

                tracing::trace!(trace_id = %self.trace_id, ">>Y: (yield)");
                wire::write_control(self.stream, codes::HMUX_YIELD).await?;
                self.stream.flush().await?;

                // Drain until the backend acknowledges, handling anything it
                // interleaves before the ACK.
                if let Some(outcome) = self
                    .drain_until_ack(response, &mut has_header, &mut has_status)
                    .await?
                {
                    return Ok(ExchangeResult { outcome, idle_since: Instant::now() });
                }
            }
        }

        tracing::trace!(trace_id = %self.trace_id, ">>Q: (quit)");
        wire::write_control(self.stream, codes::HMUX_QUIT).await?;
        self.stream.flush().await?;

        let idle_since = Instant::now();

        let outcome = self
            .read_response(response, &mut has_header, &mut has_status, allow_busy)
            .await?;

        Ok(ExchangeResult { outcome, idle_since })
    }

    /// Write the request delimiters: uri, query, method, identity fields,
    /// TLS markers and all client headers except hop-by-hop `Connection`.
    async fn write_head(&mut self, head: &RequestHead) -> Result<(), HmuxError> {
        let w = &mut *self.stream;

        tracing::trace!(trace_id = %self.trace_id, uri = %head.uri, ">>U: uri");
        wire::write_string(w, codes::HMUX_URI, &head.uri).await?;

        if let Some(query) = &head.query {
            tracing::trace!(trace_id = %self.trace_id, %query, ">>e: query");
            wire::write_string(w, codes::CSE_QUERY_STRING, query).await?;
        }

        wire::write_string(w, codes::HMUX_METHOD, &head.method).await?;
        wire::write_string(w, codes::CSE_SERVER_TYPE, SERVER_TYPE).await?;
        wire::write_string(w, codes::HMUX_SERVER_NAME, &head.server_name).await?;
        wire::write_string(w, codes::CSE_SERVER_PORT, &head.server_port).await?;
        wire::write_string(w, codes::CSE_REMOTE_ADDR, &head.remote_addr).await?;
        wire::write_string(w, codes::CSE_REMOTE_HOST, &head.remote_host).await?;
        wire::write_string(w, codes::CSE_PROTOCOL, &head.protocol).await?;

        if head.is_secure {
            tracing::trace!(trace_id = %self.trace_id, ">>r: secure");
            wire::write_string(w, codes::CSE_IS_SECURE, "").await?;
            wire::write_header(w, "HTTPS", "on").await?;

            if let Some(key_size) = head.key_size {
                wire::write_header(w, "SSL_SECRETKEYSIZE", &key_size.to_string()).await?;
            }
        }

        if let Some(cert) = &head.client_cert {
            tracing::trace!(trace_id = %self.trace_id, len = cert.len(), ">>t: client certificate");
            wire::write_tuple(w, codes::CSE_CLIENT_CERT, cert).await?;
        }

        for (name, value) in &head.headers {
            // Hop-by-hop; meaningless across the multiplexed link.
            if name.eq_ignore_ascii_case("Connection") {
                continue;
            }

            wire::write_header(w, name, value).await?;
        }

        Ok(())
    }

    async fn write_data(&mut self, data: &[u8]) -> Result<(), HmuxError> {
        for chunk in data.chunks(CHUNK_SIZE) {
            wire::write_tuple(self.stream, codes::HMUX_DATA, chunk).await?;
        }
        Ok(())
    }

    /// Read codes after a YIELD until the backend's ACK. A QUIT/EXIT or
    /// end-of-stream here ends the whole exchange early.
    async fn drain_until_ack<R>(
        &mut self,
        response: &mut R,
        has_header: &mut bool,
        has_status: &mut bool,
    ) -> Result<Option<Outcome>, HmuxError>
    where
        R: ClientResponse + Send,
    {
        loop {
            let Some(code) = self.read_code().await? else {
                tracing::trace!(trace_id = %self.trace_id, "<<w: end of file");
                let status =
                    if *has_status { ExchangeStatus::Ok } else { ExchangeStatus::Fail };
                return Ok(Some(Outcome::new(status, Disposition::Close)));
            };

            match code {
                codes::HMUX_QUIT => {
                    tracing::trace!(trace_id = %self.trace_id, "<<Q: (keepalive)");
                    let status =
                        if *has_status { ExchangeStatus::Ok } else { ExchangeStatus::Fail };
                    return Ok(Some(Outcome::new(status, Disposition::KeepAlive)));
                }
                codes::HMUX_EXIT => {
                    tracing::trace!(trace_id = %self.trace_id, "<<X: (exit)");
                    let status =
                        if *has_status { ExchangeStatus::Ok } else { ExchangeStatus::Fail };
                    return Ok(Some(Outcome::new(status, Disposition::Close)));
                }
                codes::HMUX_YIELD => {
                    tracing::trace!(trace_id = %self.trace_id, "<<Y: (yield)");
                    continue;
                }
                codes::HMUX_ACK => {
                    tracing::trace!(trace_id = %self.trace_id, "<<A: (ack)");
                    return Ok(None);
                }
                _ => {}
            }

            let len = self.read_length().await?;

            match code {
                codes::HMUX_CHANNEL => {
                    tracing::trace!(trace_id = %self.trace_id, channel = len, "<<C: (channel)");
                }
                codes::HMUX_STATUS if *has_header => {
                    let status = self.read_string(len).await?;
                    tracing::trace!(trace_id = %self.trace_id, %status, "<<s: (status)");
                    let status_code = wire::parse_status(&status)?;
                    if status_code != 200 {
                        response.set_status(status_code);
                    }
                    *has_status = true;
                }
                codes::HMUX_HEADER if *has_header => {
                    let (name, value) = self.read_header_pair(len).await?;
                    tracing::trace!(trace_id = %self.trace_id, %name, %value, "<<H,S: (header)");
                    relay_header(response, &name, &value);
                }
                codes::HMUX_DATA => {
                    tracing::trace!(trace_id = %self.trace_id, len, "<<D: (data)");
                    *has_header = false;
                    self.relay_data(response, len).await?;
                }
                codes::HMUX_META_HEADER => {
                    let (name, value) = self.read_header_pair(len).await?;
                    tracing::trace!(trace_id = %self.trace_id, %name, %value, "<<M,S: (meta)");
                    self.apply_meta_header(&name, &value);
                }
                _ => {
                    wire::skip(self.stream, len).await?;
                }
            }
        }
    }

    /// Consume the framed response after QUIT until the backend finishes.
    async fn read_response<R>(
        &mut self,
        response: &mut R,
        has_header: &mut bool,
        has_status: &mut bool,
        allow_busy: bool,
    ) -> Result<Outcome, HmuxError>
    where
        R: ClientResponse + Send,
    {
        let mut is_busy = false;

        loop {
            let Some(code) = self.read_code().await? else {
                break;
            };

            match code {
                codes::HMUX_QUIT => {
                    tracing::trace!(trace_id = %self.trace_id, "<<Q: (keepalive)");
                    let status =
                        if is_busy { ExchangeStatus::Busy } else { ExchangeStatus::Ok };
                    return Ok(Outcome::new(status, Disposition::KeepAlive));
                }
                codes::HMUX_EXIT => {
                    tracing::trace!(trace_id = %self.trace_id, "<<X: (exit)");
                    let status = if is_busy || !*has_status {
                        ExchangeStatus::Busy
                    } else {
                        ExchangeStatus::Ok
                    };
                    return Ok(Outcome::new(status, Disposition::Close));
                }
                codes::HMUX_YIELD => {
                    tracing::trace!(trace_id = %self.trace_id, "<<Y: (yield)");
                    continue;
                }
                _ => {}
            }

            let len = self.read_length().await?;

            match code {
                codes::HMUX_DATA => {
                    tracing::trace!(trace_id = %self.trace_id, len, "<<D: (data)");
                    *has_header = false;

                    if is_busy {
                        // Busy bodies are retried elsewhere; never shown.
                        wire::skip(self.stream, len).await?;
                    } else {
                        self.relay_data(response, len).await?;
                    }
                }
                codes::HMUX_STATUS if *has_header => {
                    let status = self.read_string(len).await?;
                    tracing::trace!(trace_id = %self.trace_id, %status, "<<s: (status)");
                    *has_status = true;

                    let status_code = wire::parse_status(&status)?;
                    if status_code == 503 && allow_busy {
                        is_busy = true;
                    } else if status_code != 200 {
                        response.set_status(status_code);
                    }
                }
                codes::HMUX_HEADER if *has_header => {
                    let (name, value) = self.read_header_pair(len).await?;
                    tracing::trace!(trace_id = %self.trace_id, %name, %value, "<<H,S: (header)");

                    if !is_busy {
                        relay_header(response, &name, &value);
                    }
                }
                codes::HMUX_META_HEADER => {
                    let (name, value) = self.read_header_pair(len).await?;
                    tracing::trace!(trace_id = %self.trace_id, %name, %value, "<<M,S: (meta)");
                    self.apply_meta_header(&name, &value);
                }
                codes::HMUX_CHANNEL => {
                    tracing::trace!(trace_id = %self.trace_id, channel = len, "<<C: (channel)");
                }
                0 => {
                    tracing::trace!(trace_id = %self.trace_id, "<<0: unknown code");
                    return Ok(Outcome::new(ExchangeStatus::Fail, Disposition::Close));
                }
                other => {
                    tracing::trace!(trace_id = %self.trace_id, code = other, "<<?: unknown code");
                    wire::skip(self.stream, len).await?;
                }
            }
        }

        tracing::trace!(trace_id = %self.trace_id, "end of file");

        if *has_status {
            let status = if is_busy { ExchangeStatus::Busy } else { ExchangeStatus::Ok };
            Ok(Outcome::new(status, Disposition::Close))
        } else {
            tracing::trace!(trace_id = %self.trace_id, "unexpected end of file");
            Ok(Outcome::new(ExchangeStatus::Fail, Disposition::Close))
        }
    }

    /// `HEADER`/`META_HEADER` is always immediately followed by a `STRING`
    /// tuple carrying the value.
    async fn read_header_pair(&mut self, name_len: usize) -> Result<(String, String), HmuxError> {
        let name = self.read_string(name_len).await?;

        // The STRING code byte; the original connectors do not inspect it.
        let _ = self.read_code().await?.ok_or_else(eof)?;
        let value_len = self.read_length().await?;
        let value = self.read_string(value_len).await?;

        Ok((name, value))
    }

    fn apply_meta_header(&self, name: &str, value: &str) {
        if name == "cpu-load" {
            if let Ok(raw) = value.parse::<i64>() {
                self.server.set_cpu_load(0.001 * raw as f64);
            }
        }
    }

    async fn relay_data<R>(&mut self, response: &mut R, len: usize) -> Result<(), HmuxError>
    where
        R: ClientResponse + Send,
    {
        let mut remaining = len;
        let mut buf = vec![0u8; remaining.min(CHUNK_SIZE)];

        while remaining > 0 {
            let chunk = remaining.min(buf.len());
            self.read_exact(&mut buf[..chunk]).await?;
            response.write(Bytes::copy_from_slice(&buf[..chunk])).await?;
            remaining -= chunk;
        }

        Ok(())
    }

    /// Read one code byte. `None` means clean end-of-stream.
    async fn read_code(&mut self) -> Result<Option<u8>, HmuxError> {
        let read = tokio::time::timeout(self.socket_timeout, self.stream.read_u8())
            .await
            .map_err(|_| HmuxError::SocketTimeout)?;

        match read {
            Ok(code) => Ok(Some(code)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read_length(&mut self) -> Result<usize, HmuxError> {
        tokio::time::timeout(self.socket_timeout, wire::read_length(self.stream))
            .await
            .map_err(|_| HmuxError::SocketTimeout)?
            .map_err(HmuxError::from)
    }

    async fn read_string(&mut self, len: usize) -> Result<String, HmuxError> {
        tokio::time::timeout(self.socket_timeout, wire::read_string(self.stream, len))
            .await
            .map_err(|_| HmuxError::SocketTimeout)?
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), HmuxError> {
        tokio::time::timeout(self.socket_timeout, self.stream.read_exact(buf))
            .await
            .map_err(|_| HmuxError::SocketTimeout)?
            .map(|_| ())
            .map_err(HmuxError::from)
    }
}

fn eof() -> HmuxError {
    HmuxError::Protocol("unexpected end of stream".into())
}

/// Apply the semantic re-interpretation for `Cache-Control` and
/// `Content-Type`; everything else passes through verbatim.
fn relay_header<R: ClientResponse>(response: &mut R, name: &str, value: &str) {
    if name.eq_ignore_ascii_case("Cache-Control") {
        response.cache_control(&parse_cache_control(value));
    } else if name.eq_ignore_ascii_case("Content-Type") {
        response.content_type(value, extract_charset(value).as_deref());
    } else {
        response.header(name, value);
    }
}

/// Parse `Cache-Control` into typed directives. Unknown directives and
/// unparsable numeric arguments are dropped.
pub fn parse_cache_control(value: &str) -> Vec<CacheDirective> {
    let mut directives = Vec::new();
    let mut tokens = value
        .split([',', '=', ' '])
        .filter(|t| !t.is_empty());

    while let Some(token) = tokens.next() {
        let mut numeric = |build: fn(u32) -> CacheDirective| {
            if let Some(n) = tokens.next().and_then(|t| t.parse().ok()) {
                directives.push(build(n));
            }
        };

        if token.eq_ignore_ascii_case("no-cache") {
            directives.push(CacheDirective::NoCache);
        } else if token.eq_ignore_ascii_case("public") {
            directives.push(CacheDirective::Public);
        } else if token.eq_ignore_ascii_case("private") {
            directives.push(CacheDirective::Private);
        } else if token.eq_ignore_ascii_case("must-revalidate") {
            directives.push(CacheDirective::MustRevalidate);
        } else if token.eq_ignore_ascii_case("proxy-revalidate") {
            directives.push(CacheDirective::ProxyRevalidate);
        } else if token.eq_ignore_ascii_case("max-age") {
            numeric(CacheDirective::MaxAge);
        } else if token.eq_ignore_ascii_case("s-maxage") {
            numeric(CacheDirective::SMaxAge);
        } else if token.eq_ignore_ascii_case("post-check") {
            numeric(CacheDirective::PostCheck);
        } else if token.eq_ignore_ascii_case("pre-check") {
            numeric(CacheDirective::PreCheck);
        }
    }

    directives
}

/// Pull the charset parameter out of a `Content-Type` value.
pub fn extract_charset(content_type: &str) -> Option<String> {
    let idx = content_type.find("charset")?;
    let rest = &content_type[idx + "charset".len()..];
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=')?;
    let end = rest.find([';', ' ']).unwrap_or(rest.len());
    let charset = rest[..end].trim();

    (!charset.is_empty()).then(|| charset.to_string())
}
