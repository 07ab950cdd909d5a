//! Scripted scenario playback for the mock device port.

use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A single scripted event: played `delay` seconds after the previous one.
#[derive(Clone, Debug, serde::Deserialize)]
pub struct ScenarioEvent {
    pub delay: f64,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct Scenario {
    pub description: String,
    pub events: Vec<ScenarioEvent>,
}

static COUNTER: AtomicU64 = AtomicU64::new(0);

/// Recursively substitute the five scenario placeholders into `value`.
/// Non-string leaves pass through unchanged.
pub fn process_dynamic_values(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(substitute(s)),
        Value::Array(items) => Value::Array(items.iter().map(process_dynamic_values).collect()),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), process_dynamic_values(v));
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn substitute(s: &str) -> String {
    match s {
        "{{now}}" => {
            let secs = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            secs.to_string()
        }
        "{{random_snr}}" => format!("{:.1}", random_in_range(-20.0, 30.0)),
        "{{random_rssi}}" => format!("{:.1}", random_in_range(-110.0, -50.0)),
        "{{uuid}}" => random_hex_id(),
        "{{counter}}" => COUNTER.fetch_add(1, Ordering::Relaxed).to_string(),
        other => other.to_string(),
    }
}

fn random_in_range(low: f64, high: f64) -> f64 {
    use rand::Rng;
    rand::thread_rng().gen_range(low..high)
}

fn random_hex_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..32).map(|_| format!("{:x}", rng.gen_range(0..16u8))).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn leaves_non_placeholder_strings_untouched() {
        let v = json!({"type": "ADVERTISEMENT", "note": "hello"});
        assert_eq!(process_dynamic_values(&v), v);
    }

    #[test]
    fn substitutes_counter_and_nested_fields() {
        let v = json!({"a": ["{{counter}}", {"b": "{{counter}}"}]});
        let out = process_dynamic_values(&v);
        let first = out["a"][0].as_str().unwrap().parse::<u64>().unwrap();
        let second = out["a"][1]["b"].as_str().unwrap().parse::<u64>().unwrap();
        assert!(second > first);
    }
}
