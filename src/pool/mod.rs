//! Backend connection pooling and selection.
//!
//! # Data Flow
//! ```text
//! proxy handler
//!     → LoadBalancer::open_server (sticky / round-robin / failover)
//!     → BackendServer::open (recycle or connect-with-timeout)
//!     → Checkout { server, conn }
//!     → protocol engine owns the connection for one exchange
//!     → BackendServer::free (QUIT) or ::close (EXIT / error)
//! ```

pub mod balancer;
pub mod connection;
pub mod server;

pub use balancer::{Checkout, LoadBalancer};
pub use connection::{HmuxConnection, TraceId};
pub use server::BackendServer;
