//! Serial-backed `DevicePort` talking to a real mesh radio.
//!
//! The device emits newline-delimited JSON frames; each frame is classified
//! into a [`RawEvent`] and fanned out to subscribers. Connection loss emits a
//! single `StatusResponse("DISCONNECTED")` event and the reader task quiesces
//! rather than retrying indefinitely.

use crate::port::{resolve_destination, DeviceError, DevicePort, DeviceResult};
use async_trait::async_trait;
use meshbridge_core::{Contact, EventKind, PublicKey, RawEvent};
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

pub struct LiveSerialPort {
    serial_path: String,
    baud_rate: u32,
    contacts: RwLock<Vec<Contact>>,
    connected: Arc<AtomicBool>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<RawEvent>>>>,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    writer: AsyncMutex<Option<WriteHalf<SerialStream>>>,
}

impl LiveSerialPort {
    pub fn new(serial_path: impl Into<String>, baud_rate: u32) -> Arc<Self> {
        Arc::new(Self {
            serial_path: serial_path.into(),
            baud_rate,
            contacts: RwLock::new(Vec::new()),
            connected: Arc::new(AtomicBool::new(false)),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            reader_task: Mutex::new(None),
            writer: AsyncMutex::new(None),
        })
    }

    /// Writes one newline-delimited JSON command frame, matching the framing
    /// `classify` expects on the read side.
    async fn write_line(&self, kind: &str, data: serde_json::Value) -> DeviceResult<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(DeviceError::NotConnected)?;
        let line = serde_json::to_string(&json!({"type": kind, "data": data}))
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        writer.write_all(line.as_bytes()).await.map_err(|e| DeviceError::Transport(e.to_string()))?;
        writer.write_all(b"\n").await.map_err(|e| DeviceError::Transport(e.to_string()))?;
        writer.flush().await.map_err(|e| DeviceError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn publish(subscribers: &Mutex<Vec<mpsc::Sender<RawEvent>>>, event: RawEvent) {
        let senders: Vec<_> = subscribers.lock().clone();
        for sender in senders {
            let _ = sender.try_send(event.clone());
        }
    }

    fn classify(line: &str) -> Option<RawEvent> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let kind = value.get("type")?.as_str()?;
        let kind = match kind {
            "ADVERTISEMENT" => EventKind::Advertisement,
            "CONTACT_MSG_RECV" => EventKind::ContactMessageReceived,
            "CHANNEL_MSG_RECV" => EventKind::ChannelMessageReceived,
            "PATH_UPDATED" => EventKind::PathUpdated,
            "SEND_CONFIRMED" => EventKind::SendConfirmed,
            "TELEMETRY_RESPONSE" => EventKind::TelemetryResponse,
            "TRACE_DATA" => EventKind::TraceData,
            "BATTERY" => EventKind::Battery,
            "STATUS_RESPONSE" => EventKind::StatusResponse,
            _ => return None,
        };
        let payload = value.get("data").cloned().unwrap_or(serde_json::Value::Null);
        Some(RawEvent { kind, payload })
    }
}

#[async_trait]
impl DevicePort for LiveSerialPort {
    async fn connect(&self) -> DeviceResult<()> {
        let port = tokio_serial::new(&self.serial_path, self.baud_rate)
            .open_native_async()
            .map_err(|e| DeviceError::Transport(e.to_string()))?;
        self.connected.store(true, Ordering::SeqCst);

        let (read_half, write_half): (ReadHalf<SerialStream>, WriteHalf<SerialStream>) = tokio::io::split(port);
        *self.writer.lock().await = Some(write_half);

        let reader = BufReader::new(read_half);
        let mut lines = reader.lines();
        let connected_flag = Arc::clone(&self.connected);
        let subs = Arc::clone(&self.subscribers);
        let handle = tokio::spawn(async move {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if let Some(event) = Self::classify(&line) {
                            Self::publish(&subs, event).await;
                        }
                    }
                    Ok(None) | Err(_) => {
                        connected_flag.store(false, Ordering::SeqCst);
                        Self::publish(
                            &subs,
                            RawEvent {
                                kind: EventKind::StatusResponse,
                                payload: json!({"status": "DISCONNECTED"}),
                            },
                        )
                        .await;
                        break;
                    }
                }
            }
        });
        *self.reader_task.lock() = Some(handle);
        Ok(())
    }

    async fn disconnect(&self) -> DeviceResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader_task.lock().take() {
            handle.abort();
        }
        *self.writer.lock().await = None;
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

    async fn send_message(&self, destination: &str, text: &str, text_type: &str) -> DeviceResult<()> {
        let resolved = self.check_destination(destination)?;
        self.write_line("SEND_MESSAGE", json!({"destination": resolved.as_str(), "text": text, "text_type": text_type})).await
    }

    async fn send_channel_message(&self, text: &str, flood: bool) -> DeviceResult<()> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        self.write_line("SEND_CHANNEL_MESSAGE", json!({"text": text, "flood": flood})).await
    }

    async fn send_advert(&self, flood: bool) -> DeviceResult<()> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        self.write_line("SEND_ADVERT", json!({"flood": flood})).await
    }

    async fn send_trace_path(&self, destination: &str) -> DeviceResult<()> {
        let resolved = self.check_destination(destination)?;
        self.write_line("SEND_TRACE_PATH", json!({"destination": resolved.as_str()})).await
    }

    async fn ping(&self, destination: &str) -> DeviceResult<()> {
        let resolved = self.check_destination(destination)?;
        self.write_line("PING", json!({"destination": resolved.as_str()})).await
    }

    async fn send_telemetry_request(&self, destination: &str) -> DeviceResult<()> {
        let resolved = self.check_destination(destination)?;
        self.write_line("SEND_TELEMETRY_REQUEST", json!({"destination": resolved.as_str()})).await
    }

    async fn get_contacts(&self) -> DeviceResult<Vec<Contact>> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        Ok(self.contacts.read().clone())
    }
}

impl LiveSerialPort {
    fn check_destination(&self, destination: &str) -> Result<PublicKey, DeviceError> {
        if !self.is_connected() {
            return Err(DeviceError::NotConnected);
        }
        let contacts = self.contacts.read();
        resolve_destination(destination, contacts.iter()).map_err(DeviceError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_parses_known_kind() {
        let event = LiveSerialPort::classify(r#"{"type": "BATTERY", "data": {"battery_percent": 80}}"#).unwrap();
        assert_eq!(event.kind, EventKind::Battery);
        assert_eq!(event.payload["battery_percent"], 80);
    }

    #[test]
    fn classify_rejects_unknown_kind() {
        assert!(LiveSerialPort::classify(r#"{"type": "NOT_A_KIND"}"#).is_none());
    }

    #[tokio::test]
    async fn send_before_connect_is_not_connected() {
        let port = LiveSerialPort::new("/dev/null-not-a-real-port", 115_200);
        assert!(matches!(port.ping("aa").await, Err(DeviceError::NotConnected)));
        assert!(matches!(port.send_advert(true).await, Err(DeviceError::NotConnected)));
    }
}
