//! Core traits for the governance bridge.
//!
//! Traits mark the seams between layers:
//! - `transport`: backend transport capability (pipe, http, stream)
//! - `audit`: append-only audit log store
//! - `clock`: wall-clock source for time windows and hour checks

pub mod audit;
pub mod clock;
pub mod transport;

pub use audit::*;
pub use clock::*;
pub use transport::*;
