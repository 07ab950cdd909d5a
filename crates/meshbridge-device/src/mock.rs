//! A deterministic-enough mock `DevicePort` for development and tests.
//!
//! Either plays back a scripted [`Scenario`] or generates weighted-random
//! events over the nine event kinds, matching the relative frequencies a
//! real mesh exhibits (advertisements most common, battery/status rarest).

use crate::port::{resolve_destination, DestinationError, DeviceError, DevicePort, DeviceResult};
use crate::scenarios::{process_dynamic_values, Scenario};
use async_trait::async_trait;
use meshbridge_core::{Contact, EventKind, NodeType, PublicKey, RawEvent};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Debug)]
pub struct MockConfig {
    pub scenario: Option<Scenario>,
    pub loop_scenario: bool,
    pub num_nodes: usize,
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub center_lat: f64,
    pub center_lon: f64,
    pub gps_radius_km: f64,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            scenario: None,
            loop_scenario: false,
            num_nodes: 10,
            min_interval: Duration::from_secs_f64(1.0),
            max_interval: Duration::from_secs_f64(10.0),
            center_lat: 45.5231,
            center_lon: -122.6765,
            gps_radius_km: 10.0,
        }
    }
}

/// Weighted event kinds, matching the frequency a real mesh is expected to
/// exhibit: advertisements dominate, battery/status reports are rare.
const EVENT_WEIGHTS: &[(EventKind, u32)] = &[
    (EventKind::Advertisement, 30),
    (EventKind::ContactMessageReceived, 25),
    (EventKind::ChannelMessageReceived, 15),
    (EventKind::PathUpdated, 10),
    (EventKind::SendConfirmed, 8),
    (EventKind::TelemetryResponse, 5),
    (EventKind::TraceData, 3),
    (EventKind::Battery, 2),
    (EventKind::StatusResponse, 2),
];

pub struct MockDevicePort {
    config: MockConfig,
    contacts: RwLock<Vec<Contact>>,
    connected: AtomicBool,
    subscribers: Mutex<Vec<mpsc::Sender<RawEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MockDevicePort {
    pub fn new(config: MockConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            contacts: RwLock::new(Vec::new()),
            connected: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            task: Mutex::new(None),
        })
    }

    fn generate_simulated_nodes(&self) {
        let names = ["Basecamp", "Ridgeline", "Harbor", "Outpost", "Summit"];
        let mut rng = rand::thread_rng();
        let mut contacts = Vec::with_capacity(self.config.num_nodes);
        for i in 0..self.config.num_nodes {
            let hex: String = (0..64).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect();
            let node_type = match rng.gen_range(0..4) {
                0 => NodeType::Chat,
                1 => NodeType::Repeater,
                2 => NodeType::Room,
                _ => NodeType::None,
            };
            let name = names
                .get(i)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("Node-{i}"));
            contacts.push(Contact {
                public_key: PublicKey::new(&hex).unwrap(),
                name: Some(name),
                node_type: Some(node_type),
            });
        }
        *self.contacts.write() = contacts;
    }

    fn select_random_event_kind(&self) -> EventKind {
        let total: u32 = EVENT_WEIGHTS.iter().map(|(_, w)| w).sum();
        let mut roll = rand::thread_rng().gen_range(0..total);
        for (kind, weight) in EVENT_WEIGHTS {
            if roll < *weight {
                return *kind;
            }
            roll -= weight;
        }
        EVENT_WEIGHTS[0].0
    }

    fn create_random_event(&self) -> RawEvent {
        let kind = self.select_random_event_kind();
        let contacts = self.contacts.read();
        let mut rng = rand::thread_rng();
        let sample = contacts.get(rng.gen_range(0..contacts.len().max(1)));
        let payload = match (kind, sample) {
            (EventKind::Advertisement, Some(c)) => json!({
                "public_key": c.public_key.as_str(),
                "name": c.name,
                "node_type": format!("{:?}", c.node_type).to_lowercase(),
            }),
            (EventKind::ContactMessageReceived, Some(c)) => json!({
                "pubkey_prefix": c.public_key.prefix8(),
                "text": "simulated contact message",
            }),
            (EventKind::ChannelMessageReceived, _) => json!({
                "channel_idx": rng.gen_range(0..4u8),
                "text": "simulated channel message",
            }),
            (EventKind::TelemetryResponse, Some(c)) => json!({
                "public_key": c.public_key.as_str(),
                "battery_percent": rng.gen_range(10..100u8),
            }),
            (EventKind::Battery, Some(c)) => json!({
                "public_key": c.public_key.as_str(),
                "battery_percent": rng.gen_range(10..100u8),
            }),
            (EventKind::TraceData, Some(_)) => {
                let hop_count = rng.gen_range(1..5usize);
                let path_hashes: Vec<String> = (0..hop_count).map(|_| format!("{:02x}", rng.gen_range(0..256u16))).collect();
                let snr_values: Vec<f64> = (0..hop_count).map(|_| rng.gen_range(-20.0..10.0)).collect();
                json!({
                    "initiator_tag": rng.gen_range(0..u32::MAX),
                    "path_hashes": path_hashes,
                    "snr_values": snr_values,
                })
            }
            (EventKind::PathUpdated, Some(c)) => json!({
                "public_key": c.public_key.as_str(),
                "path_len": rng.gen_range(1..6u8),
            }),
            (EventKind::SendConfirmed, _) => json!({
                "request_id": format!("{:x}", rng.gen_range(0..u64::MAX)),
                "success": true,
            }),
            (EventKind::StatusResponse, _) => json!({
                "status": "OK",
            }),
            _ => json!({}),
        };
        RawEvent { kind, payload }
    }

    async fn publish(subscribers: &Mutex<Vec<mpsc::Sender<RawEvent>>>, event: RawEvent) {
        let senders: Vec<_> = subscribers.lock().clone();
        for sender in senders {
            // Bounded, best-effort: a full subscriber channel means that
            // subscriber is lagging; we drop rather than block ingestion.
            let _ = sender.try_send(event.clone());
        }
    }

    fn spawn_driver(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Some(scenario) = this.config.scenario.clone() {
                loop {
                    for event in &scenario.events {
                        tokio::time::sleep(Duration::from_secs_f64(event.delay)).await;
                        let data = process_dynamic_values(&event.data);
                        let kind = parse_event_kind(&event.kind);
                        Self::publish(&this.subscribers, RawEvent { kind, payload: data }).await;
                    }
                    if !this.config.loop_scenario {
                        break;
                    }
                }
            } else {
                loop {
                    let wait = rand::thread_rng()
                        .gen_range(this.config.min_interval.as_secs_f64()..this.config.max_interval.as_secs_f64());
                    tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                    let event = this.create_random_event();
                    Self::publish(&this.subscribers, event).await;
                }
            }
        })
    }

    fn into_device_error(err: DestinationError) -> RawEvent {
        RawEvent {
            kind: EventKind::StatusResponse,
            payload: json!({"error": err.to_string()}),
        }
    }
}

fn parse_event_kind(raw: &str) -> EventKind {
    match raw {
        "ADVERTISEMENT" => EventKind::Advertisement,
        "CONTACT_MSG_RECV" => EventKind::ContactMessageReceived,
        "CHANNEL_MSG_RECV" => EventKind::ChannelMessageReceived,
        "PATH_UPDATED" => EventKind::PathUpdated,
        "SEND_CONFIRMED" => EventKind::SendConfirmed,
        "TELEMETRY_RESPONSE" => EventKind::TelemetryResponse,
        "TRACE_DATA" => EventKind::TraceData,
        "BATTERY" => EventKind::Battery,
        _ => EventKind::StatusResponse,
    }
}

#[async_trait]
impl DevicePort for MockDevicePort {
    async fn connect(&self) -> DeviceResult<()> {
        self.generate_simulated_nodes();
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> DeviceResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> mpsc::Receiver<RawEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    async fn send_message(&self, destination: &str, _text: &str, _text_type: &str) -> DeviceResult<()> {
        let contacts = self.contacts.read();
        match resolve_destination(destination, contacts.iter()) {
            Ok(_) => Ok(()),
            Err(e) => {
                drop(contacts);
                Self::publish(&self.subscribers, Self::into_device_error(e)).await;
                Ok(())
            }
        }
    }

    async fn send_channel_message(&self, _text: &str, _flood: bool) -> DeviceResult<()> {
        Ok(())
    }

    async fn send_advert(&self, _flood: bool) -> DeviceResult<()> {
        Ok(())
    }

    async fn send_trace_path(&self, destination: &str) -> DeviceResult<()> {
        let contacts = self.contacts.read();
        if let Err(e) = resolve_destination(destination, contacts.iter()) {
            drop(contacts);
            Self::publish(&self.subscribers, Self::into_device_error(e)).await;
        }
        Ok(())
    }

    async fn ping(&self, destination: &str) -> DeviceResult<()> {
        let contacts = self.contacts.read();
        if let Err(e) = resolve_destination(destination, contacts.iter()) {
            drop(contacts);
            Self::publish(&self.subscribers, Self::into_device_error(e)).await;
        }
        Ok(())
    }

    async fn send_telemetry_request(&self, destination: &str) -> DeviceResult<()> {
        let contacts = self.contacts.read();
        if let Err(e) = resolve_destination(destination, contacts.iter()) {
            drop(contacts);
            Self::publish(&self.subscribers, Self::into_device_error(e)).await;
        }
        Ok(())
    }

    async fn get_contacts(&self) -> DeviceResult<Vec<Contact>> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        Ok(self.contacts.read().clone())
    }
}

impl MockDevicePort {
    /// Start the background event-production task. Call once after `connect`.
    pub fn start(self: &Arc<Self>) {
        let handle = self.spawn_driver();
        *self.task.lock() = Some(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_populates_contacts() {
        let port = MockDevicePort::new(MockConfig { num_nodes: 5, ..Default::default() });
        port.connect().await.unwrap();
        let contacts = port.get_contacts().await.unwrap();
        assert_eq!(contacts.len(), 5);
    }

    #[tokio::test]
    async fn disconnected_get_contacts_errors() {
        let port = MockDevicePort::new(MockConfig::default());
        assert!(matches!(port.get_contacts().await, Err(DeviceError::NotConnected)));
    }

    #[tokio::test]
    async fn trace_data_event_carries_string_path_hashes() {
        let port = MockDevicePort::new(MockConfig { num_nodes: 3, ..Default::default() });
        port.connect().await.unwrap();
        let event = loop {
            let event = port.create_random_event();
            if event.kind == EventKind::TraceData {
                break event;
            }
        };
        let hashes = event.payload.get("path_hashes").unwrap().as_array().unwrap();
        assert!(!hashes.is_empty());
        assert!(hashes[0].is_string());
    }

    #[tokio::test]
    async fn send_message_unknown_destination_emits_status_event_not_error() {
        let port = MockDevicePort::new(MockConfig { num_nodes: 1, ..Default::default() });
        port.connect().await.unwrap();
        let mut rx = port.subscribe();
        let result = port.send_message("zzzzzzzzzzzzzzzz", "hi", "plain").await;
        assert!(result.is_ok());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::StatusResponse);
    }
}
