//! HMUX protocol implementation.
//!
//! # Responsibilities
//! - Define the wire-level byte codes and framing primitives
//! - Drive one request/response exchange against a backend
//! - Classify every exchange into an [`Outcome`] the entry point can act on
//!
//! # Design Decisions
//! - Framing is generic over `AsyncRead`/`AsyncWrite` so the state machine
//!   can be exercised against an in-memory duplex in tests
//! - Backend-facing failures never escape as panics; they become an
//!   `HmuxError` or a `Fail` outcome at this boundary

pub mod codes;
pub mod engine;
pub mod wire;

use std::io;

/// Errors raised while talking to a backend or relaying to the client.
#[derive(Debug, thiserror::Error)]
pub enum HmuxError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("connect timed out")]
    ConnectTimeout,

    #[error("socket read timed out")]
    SocketTimeout,

    /// The client went away mid-exchange. Not a backend fault: the caller
    /// aborts cleanly without failover or health-state mutation.
    #[error("client disconnected")]
    ClientDisconnect,

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Per-attempt result status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeStatus {
    /// Request succeeded.
    Ok,
    /// Backend reported 503; eligible for one retry elsewhere.
    Busy,
    /// Hard failure (connect, socket or protocol).
    Fail,
}

/// What to do with the connection after the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Backend sent QUIT: return the connection to the idle pool.
    KeepAlive,
    /// Backend sent EXIT or the stream ended: close the connection.
    Close,
}

/// Combined per-attempt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub status: ExchangeStatus,
    pub disposition: Disposition,
}

impl Outcome {
    pub fn new(status: ExchangeStatus, disposition: Disposition) -> Self {
        Self { status, disposition }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ExchangeStatus::Ok
    }

    pub fn keep_alive(&self) -> bool {
        self.disposition == Disposition::KeepAlive
    }
}
