//! Command debouncing: collapse identical in-flight or recently-completed
//! commands onto a single execution.

use crate::models::{CommandResult, CommandType};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

struct CacheEntry {
    first_seen: Instant,
    first_seen_unix: i64,
    last_seen: Instant,
    pending: bool,
    result: Option<CommandResult>,
    waiters: Vec<oneshot::Sender<CommandResult>>,
}

pub struct Debouncer {
    window: Duration,
    max_cache_size: usize,
    enabled_commands: HashSet<CommandType>,
    enabled: bool,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

/// Canonical hash of `{type, params}`: JSON with lexicographically sorted
/// keys, matching the original's `json.dumps(..., sort_keys=True)`.
pub fn hash_command(command_type: CommandType, params: &serde_json::Value) -> String {
    let sorted: BTreeMap<String, serde_json::Value> =
        [("type".to_string(), serde_json::to_value(command_type).unwrap()), ("params".to_string(), params.clone())]
            .into_iter()
            .collect();
    let canonical = serde_json::to_string(&sorted).expect("BTreeMap serializes");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

impl Debouncer {
    pub fn new(
        window: Duration,
        max_cache_size: usize,
        enabled_commands: HashSet<CommandType>,
        enabled: bool,
    ) -> Self {
        Self { window, max_cache_size, enabled_commands, enabled, cache: Mutex::new(HashMap::new()) }
    }

    fn is_expired(entry: &CacheEntry, window: Duration) -> bool {
        entry.last_seen.elapsed() > window
    }

    /// Returns `(is_duplicate, hash, original_first_seen_unix)`. If this is a
    /// fresh command, a pending entry is created; if it duplicates an
    /// in-flight or recently-completed one, the existing entry's `last_seen`
    /// is refreshed.
    pub fn check_duplicate(
        &self,
        command_type: CommandType,
        params: &serde_json::Value,
        now_unix: i64,
    ) -> (bool, String, Option<i64>) {
        let hash = hash_command(command_type, params);
        if !self.enabled || !self.enabled_commands.contains(&command_type) {
            return (false, hash, None);
        }
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get_mut(&hash) {
            if !Self::is_expired(entry, self.window) {
                entry.last_seen = Instant::now();
                return (true, hash.clone(), Some(entry.first_seen_unix));
            }
        }
        self.evict_if_full(&mut cache);
        cache.insert(
            hash.clone(),
            CacheEntry {
                first_seen: Instant::now(),
                first_seen_unix: now_unix,
                last_seen: Instant::now(),
                pending: true,
                result: None,
                waiters: Vec::new(),
            },
        );
        (false, hash, None)
    }

    fn evict_if_full(&self, cache: &mut HashMap<String, CacheEntry>) {
        if cache.len() < self.max_cache_size {
            return;
        }
        let oldest = cache
            .iter()
            .filter(|(_, e)| !e.pending)
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            cache.remove(&key);
        }
    }

    /// Register a waiter for a duplicate's eventual result.
    pub fn add_waiter(&self, hash: &str) -> Option<oneshot::Receiver<CommandResult>> {
        let mut cache = self.cache.lock();
        let entry = cache.get_mut(hash)?;
        let (tx, rx) = oneshot::channel();
        entry.waiters.push(tx);
        Some(rx)
    }

    /// Mark a hash's command complete, caching the result and waking waiters.
    pub fn mark_completed(&self, hash: &str, result: CommandResult) {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get_mut(hash) {
            entry.pending = false;
            entry.result = Some(result.clone());
            for waiter in entry.waiters.drain(..) {
                let _ = waiter.send(result.clone());
            }
        }
    }

    pub fn get_cached_result(&self, hash: &str) -> Option<CommandResult> {
        self.cache.lock().get(hash).and_then(|e| e.result.clone())
    }

    pub fn cache_size(&self) -> usize {
        self.cache.lock().len()
    }

    /// Remove expired, non-pending entries. Intended to be called
    /// periodically by a background sweeper.
    pub fn sweep_expired(&self) {
        let mut cache = self.cache.lock();
        cache.retain(|_, entry| entry.pending || !Self::is_expired(entry, self.window));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn debouncer() -> Debouncer {
        Debouncer::new(
            Duration::from_millis(50),
            10,
            HashSet::from([CommandType::SendMessage]),
            true,
        )
    }

    #[test]
    fn first_call_is_not_duplicate() {
        let d = debouncer();
        let params = serde_json::json!({"destination": "aa", "text": "hi"});
        let (is_dup, _, _) = d.check_duplicate(CommandType::SendMessage, &params, 100);
        assert!(!is_dup);
    }

    #[test]
    fn repeat_within_window_is_duplicate() {
        let d = debouncer();
        let params = serde_json::json!({"destination": "aa", "text": "hi"});
        d.check_duplicate(CommandType::SendMessage, &params, 100);
        let (is_dup, _, original) = d.check_duplicate(CommandType::SendMessage, &params, 100);
        assert!(is_dup);
        assert_eq!(original, Some(100));
    }

    #[test]
    fn disabled_command_type_never_debounces() {
        let d = debouncer();
        let params = serde_json::json!({"flood": true});
        let (is_dup1, _, _) = d.check_duplicate(CommandType::SendAdvert, &params, 100);
        let (is_dup2, _, _) = d.check_duplicate(CommandType::SendAdvert, &params, 100);
        assert!(!is_dup1 && !is_dup2);
    }

    #[test]
    fn hash_is_order_independent_of_key_insertion() {
        let a = serde_json::json!({"b": 1, "a": 2});
        let b = serde_json::json!({"a": 2, "b": 1});
        assert_eq!(hash_command(CommandType::Ping, &a), hash_command(CommandType::Ping, &b));
    }

    #[test]
    fn mark_completed_resolves_waiters() {
        let d = debouncer();
        let params = serde_json::json!({"destination": "aa"});
        let (_, hash, _) = d.check_duplicate(CommandType::SendMessage, &params, 100);
        d.mark_completed(&hash, CommandResult::ok("r1", 101));
        assert_eq!(d.get_cached_result(&hash).unwrap().request_id, "r1");
    }
}
