//! Core data model shared across the mesh bridge crates.
//!
//! - [`types`]: entities (Node, Message, Advertisement, TracePath, Telemetry,
//!   EventLogRow), the raw event sum type, and the node-name no-downgrade rule.
//! - [`error`]: validation error type.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
