//! Event Normalizer: the single consumer of raw device events.
//!
//! Every event is appended to the forensic event log first (except a small
//! deny-list of noisy kinds), then dispatched to a per-kind handler that
//! updates the store and, for a subset of kinds, hands off to the webhook
//! dispatcher without awaiting it. The event-log append and the handler's
//! own store writes for a single event commit as one transaction, so a
//! crash or conflict never leaves the log and the entity tables disagreeing.

use meshbridge_core::*;
use meshbridge_webhook::WebhookDispatcher;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::store::{Store, StoreError};

pub struct Normalizer {
    store: Arc<Store>,
    webhook: Arc<WebhookDispatcher>,
    silent_kinds: HashSet<EventKind>,
    /// Guards against more than one concurrent contact-list refresh.
    contact_fetch_inflight: Mutex<bool>,
}

impl Normalizer {
    pub fn new(store: Arc<Store>, webhook: Arc<WebhookDispatcher>, silent_kinds: HashSet<EventKind>) -> Self {
        Self { store, webhook, silent_kinds, contact_fetch_inflight: Mutex::new(false) }
    }

    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<RawEvent>, now: impl Fn() -> i64 + Send + Sync + 'static) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(&event, now()) {
                warn!(kind = event.kind.as_str(), error = %e, "event handler failed, continuing");
            }
        }
    }

    /// Allocates an event-log id and decides whether this event should be
    /// logged at all, given the configured deny-list.
    fn event_log_id(&self, event: &RawEvent) -> Result<Option<u64>, StoreError> {
        if self.silent_kinds.contains(&event.kind) {
            Ok(None)
        } else {
            Ok(Some(self.store.next_id()?))
        }
    }

    fn handle(&self, event: &RawEvent, now: i64) -> Result<(), StoreError> {
        metrics::counter!("meshbridge_events_total", "kind" => event.kind.as_str()).increment(1);

        match event.kind {
            EventKind::Advertisement => self.handle_advertisement(event, now),
            EventKind::ContactMessageReceived => self.handle_contact_message(event, now),
            EventKind::ChannelMessageReceived => self.handle_channel_message(event, now),
            EventKind::TraceData => self.handle_trace_data(event, now),
            EventKind::TelemetryResponse | EventKind::Battery => self.handle_telemetry(event, now),
            // Informational-only kinds: only the event log write applies.
            EventKind::PathUpdated | EventKind::SendConfirmed | EventKind::StatusResponse => self.log_only(event, now),
        }
    }

    fn log_only(&self, event: &RawEvent, now: i64) -> Result<(), StoreError> {
        let Some(log_id) = self.event_log_id(event)? else { return Ok(()) };
        let payload_json = serde_json::to_string(&event.payload).unwrap_or_default();
        self.store.transaction(|session| session.append_event_log(event.kind.as_str(), &payload_json, log_id, now))
    }

    fn upsert_node_name(
        &self,
        session: &crate::store::Session,
        public_key: &PublicKey,
        candidate_name: Option<&str>,
        node_type: Option<NodeType>,
        now: i64,
    ) -> crate::store::TxResult<()> {
        let mut node = session.get_node(public_key)?.unwrap_or_else(|| Node::new(public_key.clone(), now));
        node.last_seen = now;
        if node_type.is_some() {
            node.node_type = node_type.or(node.node_type);
        }
        if should_update_name(node.name.as_deref(), candidate_name, public_key.prefix8()) {
            node.name = candidate_name.map(|s| s.to_string());
        }
        session.upsert_node(&node)
    }

    fn handle_advertisement(&self, event: &RawEvent, now: i64) -> Result<(), StoreError> {
        let Some(public_key) = event.payload.get("public_key").and_then(|v| v.as_str()) else {
            debug!("advertisement missing public_key, skipping");
            return Ok(());
        };
        let Ok(public_key) = PublicKey::new(public_key) else {
            warn!(%public_key, "advertisement has malformed public_key, skipping");
            return Ok(());
        };
        let name = event.payload.get("name").and_then(|v| v.as_str());
        let node_type = event
            .payload
            .get("node_type")
            .and_then(|v| v.as_str())
            .and_then(parse_node_type);
        let latitude = event.payload.get("latitude").and_then(|v| v.as_f64());
        let longitude = event.payload.get("longitude").and_then(|v| v.as_f64());

        let log_id = self.event_log_id(event)?;
        let advert_id = self.store.next_id()?;
        let payload_json = serde_json::to_string(&event.payload).unwrap_or_default();

        self.store.transaction(|session| {
            if let Some(log_id) = log_id {
                session.append_event_log(event.kind.as_str(), &payload_json, log_id, now)?;
            }
            self.upsert_node_name(session, &public_key, name, node_type, now)?;
            session.insert_advertisement(
                advert_id,
                &Advertisement {
                    node_public_key: public_key.clone(),
                    name: name.map(|s| s.to_string()),
                    node_type,
                    latitude,
                    longitude,
                    received_at: now,
                },
            )
        })?;
        self.webhook.send_event("advertisement", now, event.payload.clone());
        Ok(())
    }

    fn handle_contact_message(&self, event: &RawEvent, now: i64) -> Result<(), StoreError> {
        let pubkey_prefix = event.payload.get("pubkey_prefix").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let text = event.payload.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string();

        let log_id = self.event_log_id(event)?;
        let message_id = self.store.next_id()?;
        let payload_json = serde_json::to_string(&event.payload).unwrap_or_default();

        self.store.transaction(|session| {
            if let Some(log_id) = log_id {
                session.append_event_log(event.kind.as_str(), &payload_json, log_id, now)?;
            }
            session.insert_message(
                message_id,
                &Message {
                    direction: Direction::Inbound,
                    message_type: MessageType::Contact,
                    pubkey_prefix: Some(pubkey_prefix.clone()),
                    channel_idx: None,
                    text: text.clone(),
                    received_at: now,
                },
            )
        })?;
        self.webhook.send_event("contact_message", now, event.payload.clone());
        Ok(())
    }

    fn handle_channel_message(&self, event: &RawEvent, now: i64) -> Result<(), StoreError> {
        let channel_idx = event.payload.get("channel_idx").and_then(|v| v.as_u64()).unwrap_or(0) as u8;
        let text = event.payload.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string();

        let log_id = self.event_log_id(event)?;
        let message_id = self.store.next_id()?;
        let payload_json = serde_json::to_string(&event.payload).unwrap_or_default();

        self.store.transaction(|session| {
            if let Some(log_id) = log_id {
                session.append_event_log(event.kind.as_str(), &payload_json, log_id, now)?;
            }
            session.insert_message(
                message_id,
                &Message {
                    direction: Direction::Inbound,
                    message_type: MessageType::Channel,
                    pubkey_prefix: None,
                    channel_idx: Some(channel_idx),
                    text: text.clone(),
                    received_at: now,
                },
            )
        })?;
        self.webhook.send_event("channel_message", now, event.payload.clone());
        Ok(())
    }

    /// TRACE_DATA requires an `initiator_tag`; events missing it are dropped
    /// with a warning rather than stored with a synthetic value. Hop hashes
    /// are 2-hex-char hop prefixes and are carried as strings throughout.
    fn handle_trace_data(&self, event: &RawEvent, now: i64) -> Result<(), StoreError> {
        let Some(initiator_tag) = event.payload.get("initiator_tag").and_then(|v| v.as_u64()) else {
            warn!("trace data missing initiator_tag, skipping");
            return Ok(());
        };

        let (path_hashes, snr_values): (Vec<String>, Vec<f32>) =
            if let Some(inline_path) = event.payload.get("path").and_then(|v| v.as_array()) {
                let hashes = inline_path
                    .iter()
                    .filter_map(|p| p.get("hash").and_then(|h| h.as_str()))
                    .map(|h| h.to_string())
                    .collect();
                let snrs = inline_path.iter().filter_map(|p| p.get("snr").and_then(|s| s.as_f64())).map(|s| s as f32).collect();
                (hashes, snrs)
            } else {
                let hashes = event
                    .payload
                    .get("path_hashes")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|h| h.as_str()).map(|h| h.to_string()).collect())
                    .unwrap_or_default();
                let snrs = event
                    .payload
                    .get("snr_values")
                    .and_then(|v| v.as_array())
                    .map(|a| a.iter().filter_map(|s| s.as_f64()).map(|s| s as f32).collect())
                    .unwrap_or_default();
                (hashes, snrs)
            };

        let hop_count = event
            .payload
            .get("hop_count")
            .and_then(|v| v.as_u64())
            .map(|h| h as u32)
            .or(if path_hashes.is_empty() { None } else { Some(path_hashes.len() as u32) });

        let log_id = self.event_log_id(event)?;
        let trace_id = self.store.next_id()?;
        let payload_json = serde_json::to_string(&event.payload).unwrap_or_default();
        let trace = TracePath { initiator_tag: initiator_tag as u32, path_hashes, snr_values, hop_count, completed_at: now };

        self.store.transaction(|session| {
            if let Some(log_id) = log_id {
                session.append_event_log(event.kind.as_str(), &payload_json, log_id, now)?;
            }
            session.insert_trace_path(trace_id, &trace)
        })
    }

    fn handle_telemetry(&self, event: &RawEvent, now: i64) -> Result<(), StoreError> {
        let Some(public_key) = event.payload.get("public_key").and_then(|v| v.as_str()) else {
            return Ok(());
        };
        let Ok(public_key) = PublicKey::new(public_key) else { return Ok(()) };

        let log_id = self.event_log_id(event)?;
        let telemetry_id = self.store.next_id()?;
        let payload_json = serde_json::to_string(&event.payload).unwrap_or_default();
        let telemetry = Telemetry {
            node_public_key: public_key,
            battery_percent: event.payload.get("battery_percent").and_then(|v| v.as_u64()).map(|v| v as u8),
            voltage: event.payload.get("voltage").and_then(|v| v.as_f64()).map(|v| v as f32),
            uptime_seconds: event.payload.get("uptime_seconds").and_then(|v| v.as_u64()),
            received_at: now,
        };

        self.store.transaction(|session| {
            if let Some(log_id) = log_id {
                session.append_event_log(event.kind.as_str(), &payload_json, log_id, now)?;
            }
            session.insert_telemetry(telemetry_id, &telemetry)
        })
    }

    /// Single-in-flight contact fetch guard: returns `false` if a refresh is
    /// already underway, in which case the caller should reuse cached data.
    pub fn try_begin_contact_fetch(&self) -> bool {
        let mut inflight = self.contact_fetch_inflight.lock();
        if *inflight {
            false
        } else {
            *inflight = true;
            true
        }
    }

    pub fn end_contact_fetch(&self) {
        *self.contact_fetch_inflight.lock() = false;
    }
}

fn parse_node_type(raw: &str) -> Option<NodeType> {
    match raw.to_ascii_lowercase().as_str() {
        "chat" => Some(NodeType::Chat),
        "repeater" => Some(NodeType::Repeater),
        "room" => Some(NodeType::Room),
        "none" => Some(NodeType::None),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbridge_webhook::WebhookConfig;
    use std::time::Duration;
    use tempfile::tempdir;

    fn normalizer() -> Arc<Normalizer> {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let webhook = Arc::new(WebhookDispatcher::new(WebhookConfig {
            contact_message: None,
            channel_message: None,
            advertisement: None,
            timeout: Duration::from_secs(5),
            retry_count: 0,
        }));
        Arc::new(Normalizer::new(store, webhook, HashSet::new()))
    }

    #[test]
    fn advertisement_creates_node() {
        let n = normalizer();
        let key = "a".repeat(64);
        let event = RawEvent {
            kind: EventKind::Advertisement,
            payload: serde_json::json!({"public_key": key, "name": "Basecamp", "node_type": "chat"}),
        };
        n.handle(&event, 100).unwrap();
        let node = n.store.get_node(&PublicKey::new(&key).unwrap()).unwrap().unwrap();
        assert_eq!(node.name.as_deref(), Some("Basecamp"));
        assert_eq!(n.store.list_advertisements(10).unwrap().len(), 1);
    }

    #[test]
    fn trace_data_without_initiator_tag_is_dropped() {
        let n = normalizer();
        let event = RawEvent { kind: EventKind::TraceData, payload: serde_json::json!({}) };
        n.handle(&event, 0).unwrap();
    }

    #[test]
    fn trace_data_hop_count_falls_back_to_path_length() {
        let n = normalizer();
        let event = RawEvent {
            kind: EventKind::TraceData,
            payload: serde_json::json!({"initiator_tag": 7, "path_hashes": ["a1", "b2", "c3"]}),
        };
        n.handle(&event, 0).unwrap();
        let traces = n.store.list_trace_paths(10).unwrap();
        assert_eq!(traces[0].path_hashes, vec!["a1", "b2", "c3"]);
        assert_eq!(traces[0].hop_count, Some(3));
    }

    #[test]
    fn contact_fetch_guard_allows_only_one_inflight() {
        let n = normalizer();
        assert!(n.try_begin_contact_fetch());
        assert!(!n.try_begin_contact_fetch());
        n.end_contact_fetch();
        assert!(n.try_begin_contact_fetch());
    }

    #[test]
    fn channel_message_stores_with_channel_idx_only() {
        let n = normalizer();
        let event = RawEvent {
            kind: EventKind::ChannelMessageReceived,
            payload: serde_json::json!({"channel_idx": 2, "text": "hello"}),
        };
        n.handle(&event, 5).unwrap();
    }

    #[test]
    fn silent_kind_skips_event_log_but_not_entity_write() {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let webhook = Arc::new(WebhookDispatcher::new(WebhookConfig {
            contact_message: None,
            channel_message: None,
            advertisement: None,
            timeout: Duration::from_secs(5),
            retry_count: 0,
        }));
        let mut silent = HashSet::new();
        silent.insert(EventKind::TraceData);
        let n = Normalizer::new(store, webhook, silent);
        let event = RawEvent {
            kind: EventKind::TraceData,
            payload: serde_json::json!({"initiator_tag": 1, "path_hashes": ["aa"]}),
        };
        n.handle(&event, 0).unwrap();
        assert_eq!(n.store.list_trace_paths(10).unwrap().len(), 1);
    }
}
