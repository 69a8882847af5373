//! sizeforge-core: shared identifiers, the unified error type and
//! configuration for the sizeforge compression service.
//!
//! Every other crate in the workspace funnels its failures into [`Error`] and
//! reads its settings from [`config::Config`].

pub mod config;
pub mod error;
pub mod ids;

pub use error::{Error, Result};
pub use ids::JobId;
