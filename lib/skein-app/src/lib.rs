//! High-level application primitives.
//!
//! This crate provides common primitives necessary for bootstrapping a host process prior to running a skein runtime,
//! such as initializing logging.
#![deny(warnings)]
#![deny(missing_docs)]

#[cfg(feature = "logging")]
pub mod logging;

/// Common imports.
pub mod prelude {
    #[cfg(feature = "logging")]
    pub use super::logging::{fatal_and_exit, initialize_logging};
}
