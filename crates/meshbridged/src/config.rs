//! Configuration for meshbridged, resolved CLI > env (`MESHCORE_*`) > default.

use clap::Parser;
use meshbridge_queue::QueueFullBehavior;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "meshbridged")]
#[command(about = "Bridges a meshcore radio device to webhook and HTTP query consumers")]
pub struct Config {
    // --- Device ----------------------------------------------------------
    /// Serial device path, e.g. /dev/ttyUSB0. Ignored in mock mode.
    #[arg(long, env = "MESHCORE_SERIAL_PORT", default_value = "/dev/ttyUSB0")]
    pub serial_port: String,

    #[arg(long, env = "MESHCORE_BAUD_RATE", default_value_t = 115_200)]
    pub baud_rate: u32,

    /// Run against a simulated device instead of a real one.
    #[arg(long, env = "MESHCORE_MOCK_MODE")]
    pub mock_mode: bool,

    #[arg(long, env = "MESHCORE_MOCK_SCENARIO")]
    pub mock_scenario: Option<PathBuf>,

    #[arg(long, env = "MESHCORE_MOCK_LOOP_SCENARIO")]
    pub mock_loop_scenario: bool,

    #[arg(long, env = "MESHCORE_MOCK_NUM_NODES", default_value_t = 10)]
    pub mock_num_nodes: usize,

    #[arg(long, env = "MESHCORE_MOCK_MIN_INTERVAL", default_value_t = 1.0)]
    pub mock_min_interval: f64,

    #[arg(long, env = "MESHCORE_MOCK_MAX_INTERVAL", default_value_t = 10.0)]
    pub mock_max_interval: f64,

    #[arg(long, env = "MESHCORE_MOCK_CENTER_LAT", default_value_t = 45.5231)]
    pub mock_center_lat: f64,

    #[arg(long, env = "MESHCORE_MOCK_CENTER_LON", default_value_t = -122.6765)]
    pub mock_center_lon: f64,

    #[arg(long, env = "MESHCORE_MOCK_GPS_RADIUS_KM", default_value_t = 10.0)]
    pub mock_gps_radius_km: f64,

    // --- Storage -----------------------------------------------------------
    #[arg(long, env = "MESHCORE_DB_PATH", default_value = "./data/meshbridge")]
    pub db_path: PathBuf,

    #[arg(long, env = "MESHCORE_RETENTION_DAYS", default_value_t = 30)]
    pub retention_days: u32,

    #[arg(long, env = "MESHCORE_CLEANUP_INTERVAL_HOURS", default_value_t = 24)]
    pub cleanup_interval_hours: u64,

    // --- HTTP API ------------------------------------------------------------
    #[arg(long, env = "MESHCORE_API_HOST", default_value = "0.0.0.0")]
    pub api_host: IpAddr,

    #[arg(long, env = "MESHCORE_API_PORT", default_value_t = 8000)]
    pub api_port: u16,

    #[arg(long, env = "MESHCORE_BEARER_TOKEN")]
    pub bearer_token: Option<String>,

    #[arg(long, env = "MESHCORE_METRICS_ENABLED", default_value_t = true)]
    pub metrics_enabled: bool,

    #[arg(long, env = "MESHCORE_ENABLE_WRITE", default_value_t = true)]
    pub enable_write: bool,

    // --- Logging -------------------------------------------------------------
    #[arg(long, env = "MESHCORE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// "pretty" or "json"
    #[arg(long, env = "MESHCORE_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,

    // --- Webhooks --------------------------------------------------------------
    #[arg(long, env = "MESHCORE_WEBHOOK_MESSAGE_DIRECT_URL")]
    pub webhook_message_direct_url: Option<String>,

    #[arg(long, env = "MESHCORE_WEBHOOK_MESSAGE_DIRECT_JSONPATH", default_value = "$")]
    pub webhook_message_direct_jsonpath: String,

    #[arg(long, env = "MESHCORE_WEBHOOK_MESSAGE_CHANNEL_URL")]
    pub webhook_message_channel_url: Option<String>,

    #[arg(long, env = "MESHCORE_WEBHOOK_MESSAGE_CHANNEL_JSONPATH", default_value = "$")]
    pub webhook_message_channel_jsonpath: String,

    #[arg(long, env = "MESHCORE_WEBHOOK_ADVERTISEMENT_URL")]
    pub webhook_advertisement_url: Option<String>,

    #[arg(long, env = "MESHCORE_WEBHOOK_ADVERTISEMENT_JSONPATH", default_value = "$")]
    pub webhook_advertisement_jsonpath: String,

    #[arg(long, env = "MESHCORE_WEBHOOK_TIMEOUT", default_value_t = 5)]
    pub webhook_timeout_secs: u64,

    #[arg(long, env = "MESHCORE_WEBHOOK_RETRY_COUNT", default_value_t = 3)]
    pub webhook_retry_count: u32,

    // --- Command queue -------------------------------------------------------------
    #[arg(long, env = "MESHCORE_QUEUE_MAX_SIZE", default_value_t = 100)]
    pub queue_max_size: usize,

    #[arg(long, env = "MESHCORE_QUEUE_FULL_BEHAVIOR", default_value = "reject")]
    pub queue_full_behavior: String,

    #[arg(long, env = "MESHCORE_QUEUE_TIMEOUT_SECONDS", default_value_t = 30.0)]
    pub queue_timeout_seconds: f64,

    #[arg(long, env = "MESHCORE_RATE_LIMIT_ENABLED", default_value_t = true)]
    pub rate_limit_enabled: bool,

    #[arg(long, env = "MESHCORE_RATE_LIMIT_PER_SECOND", default_value_t = 2.0)]
    pub rate_limit_per_second: f64,

    #[arg(long, env = "MESHCORE_RATE_LIMIT_BURST", default_value_t = 5.0)]
    pub rate_limit_burst: f64,

    #[arg(long, env = "MESHCORE_DEBOUNCE_ENABLED", default_value_t = true)]
    pub debounce_enabled: bool,

    #[arg(long, env = "MESHCORE_DEBOUNCE_WINDOW_SECONDS", default_value_t = 5.0)]
    pub debounce_window_seconds: f64,

    #[arg(long, env = "MESHCORE_DEBOUNCE_CACHE_MAX_SIZE", default_value_t = 1000)]
    pub debounce_cache_max_size: usize,

    /// Comma-separated CommandType names; defaults to the three commands the
    /// original enabled by default (send_message, send_channel_message, send_advert).
    #[arg(long, env = "MESHCORE_DEBOUNCE_COMMANDS", value_delimiter = ',', default_value = "send_message,send_channel_message,send_advert")]
    pub debounce_commands: Vec<String>,

    /// Comma-separated EventKind names (e.g. `BATTERY,STATUS_RESPONSE`) to
    /// exclude from the forensic event log. Entity storage and webhook
    /// dispatch for these kinds are unaffected.
    #[arg(long, env = "MESHCORE_SILENT_EVENT_KINDS", value_delimiter = ',', default_value = "")]
    pub silent_event_kinds: Vec<String>,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.mock_mode && self.serial_port.is_empty() {
            anyhow::bail!("serial_port must be set when not running in mock mode");
        }
        if self.retention_days == 0 {
            anyhow::bail!("retention_days must be greater than zero");
        }
        if !matches!(self.queue_full_behavior.as_str(), "reject" | "drop_oldest") {
            anyhow::bail!("queue_full_behavior must be \"reject\" or \"drop_oldest\"");
        }
        Ok(())
    }

    pub fn queue_full_behavior(&self) -> QueueFullBehavior {
        match self.queue_full_behavior.as_str() {
            "drop_oldest" => QueueFullBehavior::DropOldest,
            _ => QueueFullBehavior::Reject,
        }
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours * 3600)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from(["meshbridged", "--mock-mode"])
    }

    #[test]
    fn default_config_validates() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn zero_retention_days_rejected() {
        let mut config = base_config();
        config.retention_days = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_queue_full_behavior_rejected() {
        let mut config = base_config();
        config.queue_full_behavior = "explode".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn silent_event_kinds_parses_comma_list() {
        let config = Config::parse_from(["meshbridged", "--mock-mode", "--silent-event-kinds", "BATTERY,STATUS_RESPONSE"]);
        assert_eq!(config.silent_event_kinds, vec!["BATTERY", "STATUS_RESPONSE"]);
    }
}
