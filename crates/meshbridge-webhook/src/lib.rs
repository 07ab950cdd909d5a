//! Fire-and-forget webhook fanout for normalized events.
//!
//! Routing is per event kind (contact message / channel message /
//! advertisement), each with its own URL and JSONPath projection. Dispatch
//! never blocks the caller: `send_event` spawns its own retry sequence.

mod jsonpath;

use jsonpath::project;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, warn};

#[derive(Clone, Debug)]
pub struct WebhookRoute {
    pub url: String,
    /// JSONPath expression; invalid expressions are reverted to `$` (the
    /// whole payload) at config-load time with a warning, so this field is
    /// always valid by the time it reaches `send_event`.
    pub jsonpath: String,
}

#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub contact_message: Option<WebhookRoute>,
    pub channel_message: Option<WebhookRoute>,
    pub advertisement: Option<WebhookRoute>,
    pub timeout: Duration,
    pub retry_count: u32,
}

/// Validate a JSONPath expression at config-load time, reverting to `$` and
/// warning if it does not parse.
pub fn validate_jsonpath(expr: &str) -> String {
    if jsonpath::parses(expr) {
        expr.to_string()
    } else {
        warn!(expr, "invalid JSONPath expression, falling back to whole payload");
        "$".to_string()
    }
}

pub struct WebhookDispatcher {
    client: Client,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(config: WebhookConfig) -> Self {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("reqwest client builds with a finite timeout");
        Self { client, config }
    }

    fn route_for(&self, event_type: &str) -> Option<&WebhookRoute> {
        match event_type {
            "contact_message" => self.config.contact_message.as_ref(),
            "channel_message" => self.config.channel_message.as_ref(),
            "advertisement" => self.config.advertisement.as_ref(),
            _ => None,
        }
    }

    /// Project and POST `data` for `event_type`. Spawns its own retry
    /// sequence and returns immediately; never awaited by the normalizer.
    pub fn send_event(&self, event_type: &str, timestamp: i64, data: Value) {
        let Some(route) = self.route_for(event_type).cloned() else { return };
        let envelope = serde_json::json!({
            "event_type": event_type,
            "timestamp": timestamp,
            "data": data,
        });
        let projected = project(&route.jsonpath, &envelope).unwrap_or(envelope);
        let client = self.client.clone();
        let retry_count = self.config.retry_count;
        tokio::spawn(async move {
            send_with_retry(&client, &route.url, projected, retry_count).await;
        });
    }
}

fn content_type_for(value: &Value) -> (&'static str, String) {
    match value {
        Value::Object(_) | Value::Array(_) => ("application/json", value.to_string()),
        Value::String(s) => ("text/plain", s.clone()),
        other => ("application/json", other.to_string()),
    }
}

async fn send_with_retry(client: &Client, url: &str, payload: Value, retry_count: u32) {
    let (content_type, body) = content_type_for(&payload);
    let total_attempts = 1 + retry_count;
    for attempt in 0..total_attempts {
        let result = client
            .post(url)
            .header("content-type", content_type)
            .body(body.clone())
            .send()
            .await;
        match result {
            Ok(resp) if resp.status().is_success() => return,
            Ok(resp) => warn!(url, status = %resp.status(), attempt, "webhook returned non-success status"),
            Err(e) => warn!(url, %e, attempt, "webhook request failed"),
        }
        if attempt + 1 < total_attempts {
            let backoff = Duration::from_secs(2u64.saturating_pow(attempt + 1));
            tokio::time::sleep(backoff).await;
        }
    }
    error!(url, total_attempts, "webhook delivery exhausted all retries");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_jsonpath_reverts_to_root() {
        assert_eq!(validate_jsonpath("$.data.text"), "$.data.text");
        assert_eq!(validate_jsonpath("not a jsonpath ((("), "$");
    }

    #[test]
    fn content_type_by_json_shape() {
        assert_eq!(content_type_for(&serde_json::json!({"a": 1})).0, "application/json");
        assert_eq!(content_type_for(&serde_json::json!("hello")).0, "text/plain");
        assert_eq!(content_type_for(&serde_json::json!(42)).0, "application/json");
    }
}
