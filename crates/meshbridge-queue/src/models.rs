//! Command pipeline data types.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// The six outbound operations the bridge can ask the device port to perform.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    SendMessage,
    SendChannelMessage,
    SendAdvert,
    SendTracePath,
    Ping,
    SendTelemetryRequest,
}

impl FromStr for CommandType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "send_message" => Ok(Self::SendMessage),
            "send_channel_message" => Ok(Self::SendChannelMessage),
            "send_advert" => Ok(Self::SendAdvert),
            "send_trace_path" => Ok(Self::SendTracePath),
            "ping" => Ok(Self::Ping),
            "send_telemetry_request" => Ok(Self::SendTelemetryRequest),
            _ => Err(()),
        }
    }
}

/// What happens when the bounded queue is already full at enqueue time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueFullBehavior {
    Reject,
    DropOldest,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueuedCommand {
    pub command_type: CommandType,
    pub params: serde_json::Value,
    pub request_id: String,
    pub enqueued_at: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CommandResult {
    pub request_id: String,
    pub success: bool,
    pub error: Option<String>,
    pub completed_at: i64,
}

impl CommandResult {
    pub fn ok(request_id: impl Into<String>, completed_at: i64) -> Self {
        Self { request_id: request_id.into(), success: true, error: None, completed_at }
    }

    pub fn failed(request_id: impl Into<String>, error: impl Into<String>, completed_at: i64) -> Self {
        Self { request_id: request_id.into(), success: false, error: Some(error.into()), completed_at }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct QueueStats {
    pub queue_size: usize,
    pub commands_processed_total: u64,
    pub commands_failed_total: u64,
    pub commands_dropped_total: u64,
    pub commands_debounced_total: u64,
    pub commands_rejected_total: u64,
    pub debounce_cache_size: usize,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueueInfo {
    pub position: usize,
    pub estimated_wait_seconds: f64,
    pub queue_size: usize,
    pub debounced: bool,
    pub original_request_time: Option<i64>,
}
