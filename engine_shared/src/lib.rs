//! `engine_shared`
//!
//! Libraries shared by the client core and its test harness.
//!
//! Design goals:
//! - Explicit, versioned wire framing.
//! - Snapshot buffers that never reallocate in steady state.
//! - One error taxonomy for every session-level failure.
//! - No `unsafe`.

pub mod config;
pub mod error;
pub mod net;
pub mod snapshot;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::net::*;
    pub use crate::snapshot::*;
}
