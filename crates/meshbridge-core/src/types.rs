//! Core data model for the mesh bridge.
//!
//! Mirrors the entities a meshcore-style radio device reports: nodes seen on
//! the mesh, messages routed through it, its self-advertisements, trace-route
//! results, and telemetry samples. All timestamps are UTC unix seconds.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A validated, lowercase 64-char hex public key identifying a mesh node.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey(String);

impl PublicKey {
    pub fn new(raw: &str) -> Result<Self> {
        let lower = raw.to_ascii_lowercase();
        if lower.len() == 64 && lower.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(lower))
        } else {
            Err(Error::InvalidPublicKey(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `len` hex characters. `len` must not exceed the key length.
    pub fn prefix(&self, len: usize) -> &str {
        &self.0[..len.min(self.0.len())]
    }

    pub fn prefix2(&self) -> &str {
        self.prefix(2)
    }

    pub fn prefix8(&self) -> &str {
        self.prefix(8)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A validated lowercase hex prefix, 2-64 characters, used to address a node
/// without requiring its full public key.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HexPrefix(String);

impl HexPrefix {
    pub fn new(raw: &str) -> Result<Self> {
        let lower = raw.to_ascii_lowercase();
        if (2..=64).contains(&lower.len()) && lower.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(Self(lower))
        } else {
            Err(Error::InvalidPrefix(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_full_key(&self) -> bool {
        self.0.len() == 64
    }
}

/// Kind of node as reported by the device.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    Chat,
    Repeater,
    Room,
    None,
}

/// A node observed on the mesh.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub public_key: PublicKey,
    /// Precomputed for the two-tier prefix index (see Store::find_by_prefix).
    pub public_key_prefix2: String,
    pub public_key_prefix8: String,
    pub node_type: Option<NodeType>,
    pub name: Option<String>,
    pub first_seen: i64,
    pub last_seen: i64,
}

impl Node {
    pub fn new(public_key: PublicKey, now: i64) -> Self {
        let public_key_prefix2 = public_key.prefix2().to_string();
        let public_key_prefix8 = public_key.prefix8().to_string();
        Self {
            public_key,
            public_key_prefix2,
            public_key_prefix8,
            node_type: None,
            name: None,
            first_seen: now,
            last_seen: now,
        }
    }
}

/// A typed value attached to a node: exactly one of these slots is populated,
/// matching `value_type`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum TagValue {
    String(String),
    Number(f64),
    Boolean(bool),
    Coordinate { latitude: f64, longitude: f64 },
}

impl TagValue {
    pub fn validate(&self) -> Result<()> {
        if let TagValue::Coordinate { latitude, longitude } = self {
            if !(-90.0..=90.0).contains(latitude) || !(-180.0..=180.0).contains(longitude) {
                return Err(Error::CoordinateOutOfRange {
                    latitude: *latitude,
                    longitude: *longitude,
                });
            }
        }
        Ok(())
    }
}

/// A key/value tag attached to a node. Unique per `(node_public_key, key)`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeTag {
    pub node_public_key: PublicKey,
    pub key: String,
    pub value: TagValue,
    pub updated_at: i64,
}

/// Direction a message travelled relative to this bridge's device.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Whether a message targeted a direct contact or a broadcast channel.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Contact,
    Channel,
}

/// A text message observed flowing through the mesh.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub direction: Direction,
    pub message_type: MessageType,
    /// Populated iff `message_type == Contact`.
    pub pubkey_prefix: Option<String>,
    /// Populated iff `message_type == Channel`.
    pub channel_idx: Option<u8>,
    pub text: String,
    pub received_at: i64,
}

impl Message {
    /// Enforces the contact-vs-channel exclusivity invariant.
    pub fn validate(&self) -> Result<()> {
        let ok = match self.message_type {
            MessageType::Contact => self.pubkey_prefix.is_some() && self.channel_idx.is_none(),
            MessageType::Channel => self.channel_idx.is_some() && self.pubkey_prefix.is_none(),
        };
        if ok {
            Ok(())
        } else {
            Err(Error::MessageTargetAmbiguous)
        }
    }
}

/// A self-advertisement broadcast by a node.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Advertisement {
    pub node_public_key: PublicKey,
    pub name: Option<String>,
    pub node_type: Option<NodeType>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub received_at: i64,
}

/// A resolved trace-route result.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TracePath {
    pub initiator_tag: u32,
    /// 2-hex-char hop prefixes, e.g. `"a3"`.
    pub path_hashes: Vec<String>,
    pub snr_values: Vec<f32>,
    pub hop_count: Option<u32>,
    pub completed_at: i64,
}

impl TracePath {
    pub fn validate(&self) -> Result<()> {
        if let Some(hop_count) = self.hop_count {
            if !self.path_hashes.is_empty() && hop_count as usize != self.path_hashes.len() {
                return Err(Error::TracePathHopMismatch {
                    hop_count,
                    path_len: self.path_hashes.len(),
                });
            }
        }
        Ok(())
    }
}

/// A telemetry sample reported by a node.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Telemetry {
    pub node_public_key: PublicKey,
    pub battery_percent: Option<u8>,
    pub voltage: Option<f32>,
    pub uptime_seconds: Option<u64>,
    pub received_at: i64,
}

/// An append-only forensic log row. Never updated, swept only by retention.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EventLogRow {
    pub id: u64,
    pub kind: String,
    pub payload_json: String,
    pub created_at: i64,
}

/// The nine raw event kinds a device port can emit, plus a catch-all for
/// kinds the bridge does not specifically interpret.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventKind {
    Advertisement,
    ContactMessageReceived,
    ChannelMessageReceived,
    PathUpdated,
    SendConfirmed,
    TelemetryResponse,
    TraceData,
    Battery,
    StatusResponse,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Advertisement => "ADVERTISEMENT",
            EventKind::ContactMessageReceived => "CONTACT_MSG_RECV",
            EventKind::ChannelMessageReceived => "CHANNEL_MSG_RECV",
            EventKind::PathUpdated => "PATH_UPDATED",
            EventKind::SendConfirmed => "SEND_CONFIRMED",
            EventKind::TelemetryResponse => "TELEMETRY_RESPONSE",
            EventKind::TraceData => "TRACE_DATA",
            EventKind::Battery => "BATTERY",
            EventKind::StatusResponse => "STATUS_RESPONSE",
        }
    }

    /// Parses the same tokens `as_str` produces, case-insensitively, for use
    /// in configuration (e.g. a comma-delimited deny-list of silent kinds).
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_uppercase().as_str() {
            "ADVERTISEMENT" => Some(EventKind::Advertisement),
            "CONTACT_MSG_RECV" => Some(EventKind::ContactMessageReceived),
            "CHANNEL_MSG_RECV" => Some(EventKind::ChannelMessageReceived),
            "PATH_UPDATED" => Some(EventKind::PathUpdated),
            "SEND_CONFIRMED" => Some(EventKind::SendConfirmed),
            "TELEMETRY_RESPONSE" => Some(EventKind::TelemetryResponse),
            "TRACE_DATA" => Some(EventKind::TraceData),
            "BATTERY" => Some(EventKind::Battery),
            "STATUS_RESPONSE" => Some(EventKind::StatusResponse),
            _ => None,
        }
    }
}

/// A raw event as emitted by a `DevicePort`, before normalization.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    pub kind: EventKind,
    pub payload: serde_json::Value,
}

/// A minimal contact record, as returned by `DevicePort::get_contacts`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Contact {
    pub public_key: PublicKey,
    pub name: Option<String>,
    pub node_type: Option<NodeType>,
}

/// Decide whether a candidate name should replace a node's current name.
///
/// No-downgrade rule: an existing non-placeholder name is never overwritten
/// by a placeholder (an 8-hex-char key fragment), and a candidate is only
/// applied if the node has no name yet or the candidate is itself non-empty
/// and not equal to the current name's placeholder form.
pub fn should_update_name(current: Option<&str>, candidate: Option<&str>, key_prefix8: &str) -> bool {
    let candidate = match candidate {
        Some(c) if !c.is_empty() => c,
        _ => return false,
    };
    match current {
        None => true,
        Some(existing) if existing == key_prefix8 => candidate != key_prefix8,
        Some(existing) => existing != candidate && candidate != key_prefix8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_rejects_bad_length() {
        assert!(PublicKey::new("abcd").is_err());
        assert!(PublicKey::new(&"a".repeat(64)).is_ok());
    }

    #[test]
    fn prefix_derivation() {
        let key = PublicKey::new(&"ab".repeat(32)).unwrap();
        assert_eq!(key.prefix2(), "ab");
        assert_eq!(key.prefix8(), "abababab");
    }

    #[test]
    fn message_validate_rejects_both_targets() {
        let msg = Message {
            direction: Direction::Inbound,
            message_type: MessageType::Contact,
            pubkey_prefix: Some("ab".into()),
            channel_idx: Some(1),
            text: "hi".into(),
            received_at: 0,
        };
        assert!(msg.validate().is_err());
    }

    #[test]
    fn trace_path_hop_count_mismatch() {
        let tp = TracePath {
            initiator_tag: 1,
            path_hashes: vec!["a1".into(), "b2".into(), "c3".into()],
            snr_values: vec![],
            hop_count: Some(2),
            completed_at: 0,
        };
        assert!(tp.validate().is_err());
    }

    #[test]
    fn name_no_downgrade() {
        assert!(should_update_name(None, Some("Alice"), "abababab"));
        assert!(!should_update_name(Some("Alice"), Some("abababab"), "abababab"));
        assert!(should_update_name(Some("abababab"), Some("Alice"), "abababab"));
        assert!(!should_update_name(Some("Alice"), Some("Alice"), "abababab"));
        assert!(!should_update_name(Some("Alice"), None, "abababab"));
    }

    #[test]
    fn tag_value_rejects_bad_coordinates() {
        let tag = TagValue::Coordinate { latitude: 200.0, longitude: 0.0 };
        assert!(tag.validate().is_err());
    }

    #[test]
    fn event_kind_parse_round_trips() {
        assert_eq!(EventKind::parse("battery"), Some(EventKind::Battery));
        assert_eq!(EventKind::parse("TRACE_DATA"), Some(EventKind::TraceData));
        assert_eq!(EventKind::parse("nonsense"), None);
    }
}
