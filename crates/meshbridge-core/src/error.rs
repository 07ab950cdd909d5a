//! Error types shared across the bridge

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core validation errors: malformed keys, out-of-range tag values, bad invariants.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid hex prefix: {0}")]
    InvalidPrefix(String),

    #[error("coordinate out of range: latitude {latitude}, longitude {longitude}")]
    CoordinateOutOfRange { latitude: f64, longitude: f64 },

    #[error("message must reference exactly one of pubkey_prefix or channel_idx")]
    MessageTargetAmbiguous,

    #[error("trace path hop_count {hop_count} does not match path_hashes length {path_len}")]
    TracePathHopMismatch { hop_count: u32, path_len: usize },
}
