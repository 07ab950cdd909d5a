//! The `DevicePort` trait: everything the bridge can ask of a mesh radio.

use async_trait::async_trait;
use meshbridge_core::{Contact, PublicKey};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("prefix too short: must be at least 2 hex characters")]
    PrefixTooShort,
    #[error("no contact matches prefix {0}")]
    NotFound(String),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not connected")]
    NotConnected,
    #[error("destination resolution failed: {0}")]
    Destination(#[from] DestinationError),
    #[error("transport error: {0}")]
    Transport(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

/// Resolve a user-supplied destination string against a contact list,
/// following the same rule every `DevicePort` implementation must obey:
///
/// - A full 64-hex-char key passes through unchanged (no lookup).
/// - A prefix shorter than 2 characters is rejected.
/// - Zero matches is a `NotFound` error.
/// - Multiple matches resolve deterministically to the first (by the
///   iteration order of `contacts`) with a caller-visible warning.
pub fn resolve_destination<'a>(
    destination: &str,
    contacts: impl Iterator<Item = &'a Contact>,
) -> Result<PublicKey, DestinationError> {
    if let Ok(full) = PublicKey::new(destination) {
        return Ok(full);
    }
    let prefix = destination.to_ascii_lowercase();
    if prefix.len() < 2 {
        return Err(DestinationError::PrefixTooShort);
    }
    let mut matches = contacts.filter(|c| c.public_key.as_str().starts_with(&prefix));
    let first = matches
        .next()
        .ok_or_else(|| DestinationError::NotFound(prefix.clone()))?;
    if matches.next().is_some() {
        tracing::warn!(prefix = %prefix, "multiple contacts match prefix, using first deterministic match");
    }
    Ok(first.public_key.clone())
}

/// The capability set a physical or simulated mesh radio exposes to the
/// bridge. Command methods never propagate transport failures as `Err` for
/// destination-resolution problems; see each implementation's failure
/// semantics.
#[async_trait]
pub trait DevicePort: Send + Sync {
    async fn connect(&self) -> DeviceResult<()>;
    async fn disconnect(&self) -> DeviceResult<()>;
    fn is_connected(&self) -> bool;

    /// Subscribe to the raw event stream. Each subscriber gets its own
    /// bounded channel; a slow subscriber drops its oldest unread event
    /// rather than stalling ingestion.
    fn subscribe(&self) -> mpsc::Receiver<meshbridge_core::RawEvent>;

    async fn send_message(&self, destination: &str, text: &str, text_type: &str) -> DeviceResult<()>;
    async fn send_channel_message(&self, text: &str, flood: bool) -> DeviceResult<()>;
    async fn send_advert(&self, flood: bool) -> DeviceResult<()>;
    async fn send_trace_path(&self, destination: &str) -> DeviceResult<()>;
    async fn ping(&self, destination: &str) -> DeviceResult<()>;
    async fn send_telemetry_request(&self, destination: &str) -> DeviceResult<()>;
    async fn get_contacts(&self) -> DeviceResult<Vec<Contact>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbridge_core::NodeType;

    fn contact(key: &str) -> Contact {
        Contact {
            public_key: PublicKey::new(key).unwrap(),
            name: None,
            node_type: Some(NodeType::Chat),
        }
    }

    #[test]
    fn full_key_passes_through() {
        let key = "a".repeat(64);
        let resolved = resolve_destination(&key, std::iter::empty()).unwrap();
        assert_eq!(resolved.as_str(), key);
    }

    #[test]
    fn prefix_too_short_rejected() {
        assert!(matches!(
            resolve_destination("a", std::iter::empty()),
            Err(DestinationError::PrefixTooShort)
        ));
    }

    #[test]
    fn prefix_not_found() {
        let contacts = vec![contact(&"b".repeat(64))];
        assert!(matches!(
            resolve_destination("aa", contacts.iter()),
            Err(DestinationError::NotFound(_))
        ));
    }

    #[test]
    fn prefix_multiple_matches_first_wins() {
        let contacts = vec![contact(&format!("aa{}", "1".repeat(62))), contact(&format!("aa{}", "2".repeat(62)))];
        let resolved = resolve_destination("aa", contacts.iter()).unwrap();
        assert_eq!(resolved, contacts[0].public_key);
    }
}
