#![deny(unused)]
//! Interception middleware and HTTP surface for the governance bridge.
//!
//! This crate assembles the governance engine, backend router and usage
//! tracker into one [`Bridge`], exposes the governed call path through the
//! [`Interceptor`], and serves it over HTTP with [`GatewayServer`].

pub mod bridge;
pub mod interceptor;
pub mod server;

pub use bridge::{Bridge, ReloadReport};
pub use interceptor::{resolve_session_id, CallFailure, CallResult, Interceptor, MAX_SESSION_ID_LEN};
pub use server::{status_for, AppState, ConfigLoader, GatewayConfig, GatewayServer};
