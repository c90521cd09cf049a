#![deny(unused)]
//! Backend routing for the governance bridge.
//!
//! Owns one long-lived connection per backend and forwards governed tool
//! calls over pipe (child process), HTTP, or TCP stream transports.

pub mod router;
pub mod transport;

pub use router::{BackendRouter, DEFAULT_CONNECT_TIMEOUT};
pub use transport::{connect, HttpTransport, PipeTransport, StreamTransport};
