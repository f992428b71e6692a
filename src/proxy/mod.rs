//! The HTTP-facing side of the connector.
//!
//! `handler` owns the router and the per-request retry state machine,
//! `session` extracts session ids for sticky routing, `surface` defines the
//! client-response abstraction the protocol engine writes into, and
//! `status` renders the diagnostics page.

pub mod handler;
pub mod session;
pub mod status;
pub mod surface;

pub use handler::{build_router, AppState};
