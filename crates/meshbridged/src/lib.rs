//! meshbridged - MeshCore bridge daemon
//!
//! Bridges a local radio-mesh serial device to the outside world:
//! - Normalizes raw device events into a persistent store
//! - Fans normalized events out to webhooks
//! - Serves an HTTP query API over stored nodes, messages, and telemetry
//! - Accepts outbound commands through a rate-limited, debounced queue

pub mod api;
pub mod config;
pub mod normalizer;
pub mod store;
pub mod supervisor;

pub use config::Config;
pub use normalizer::Normalizer;
pub use store::Store;
pub use supervisor::{AppState, Supervisor, SupervisorError};
