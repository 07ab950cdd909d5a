//! Command pipeline: debounce outbound device commands, queue them with
//! backpressure, rate-limit dispatch, and run the single worker that drives
//! the `DevicePort`.

pub mod debouncer;
pub mod models;
pub mod queue;
pub mod rate_limiter;

pub use debouncer::Debouncer;
pub use models::*;
pub use queue::{CommandQueue, EnqueueOutcome, QueueError};
pub use rate_limiter::TokenBucket;
