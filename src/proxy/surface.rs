//! Abstract client-facing surfaces.
//!
//! The protocol engine never touches hyper types directly: it reads the
//! request body and writes the response through these traits, so the shape
//! of the embedding front end stays at the edge and the engine can run
//! against recording implementations in tests.

use std::future::Future;

use bytes::Bytes;

use crate::hmux::HmuxError;

/// Typed `Cache-Control` directives, the semantic re-interpretation applied
/// to that header instead of verbatim pass-through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheDirective {
    NoCache,
    Public,
    Private,
    MustRevalidate,
    ProxyRevalidate,
    MaxAge(u32),
    SMaxAge(u32),
    PostCheck(u32),
    PreCheck(u32),
}

impl std::fmt::Display for CacheDirective {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheDirective::NoCache => write!(f, "no-cache"),
            CacheDirective::Public => write!(f, "public"),
            CacheDirective::Private => write!(f, "private"),
            CacheDirective::MustRevalidate => write!(f, "must-revalidate"),
            CacheDirective::ProxyRevalidate => write!(f, "proxy-revalidate"),
            CacheDirective::MaxAge(n) => write!(f, "max-age={n}"),
            CacheDirective::SMaxAge(n) => write!(f, "s-maxage={n}"),
            CacheDirective::PostCheck(n) => write!(f, "post-check={n}"),
            CacheDirective::PreCheck(n) => write!(f, "pre-check={n}"),
        }
    }
}

/// Outbound response the engine relays the backend's answer into.
///
/// Status and headers accumulate until the first body write commits them;
/// `write` surfaces a client disconnect as [`HmuxError::ClientDisconnect`].
pub trait ClientResponse {
    fn set_status(&mut self, status: u16);

    fn header(&mut self, name: &str, value: &str);

    /// `Content-Type` with the charset already extracted.
    fn content_type(&mut self, value: &str, charset: Option<&str>);

    /// Parsed `Cache-Control` directives.
    fn cache_control(&mut self, directives: &[CacheDirective]);

    fn write(&mut self, data: Bytes)
        -> impl Future<Output = Result<(), HmuxError>> + Send;
}

/// Inbound request body, pulled chunk by chunk during the backpressure
/// handshake. `Ok(None)` means the body is complete; errors mean the client
/// went away.
pub trait RequestBody {
    fn next_chunk(&mut self)
        -> impl Future<Output = Result<Option<Bytes>, HmuxError>> + Send;
}

/// A body that was fully buffered up front.
pub struct CompleteBody;

impl RequestBody for CompleteBody {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, HmuxError> {
        Ok(None)
    }
}
