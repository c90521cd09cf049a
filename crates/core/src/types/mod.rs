//! Core type definitions for the governance bridge.
//!
//! Broken down into submodules by concern; everything is re-exported here.

pub mod audit;
pub mod backend;
pub mod decision;
pub mod invocation;
pub mod policy;

pub use audit::*;
pub use backend::*;
pub use decision::*;
pub use invocation::*;
pub use policy::*;
