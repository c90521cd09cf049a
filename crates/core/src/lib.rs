#![deny(unused)]
//! Core types, traits, and error definitions for the governance bridge.
//!
//! This crate provides the foundational building blocks shared by the
//! governance engine, the backend router, the audit stores and the gateway.

pub mod config;
pub mod error;
pub mod mocks;
pub mod traits;
pub mod types;

pub use error::{CallError, Error, ErrorKind, Result};
pub use traits::*;
pub use types::*;
