//! Bounded FIFO command queue and its single worker.

use crate::debouncer::{hash_command, Debouncer};
use crate::models::{CommandResult, CommandType, QueueFullBehavior, QueueInfo, QueueStats, QueuedCommand};
use crate::rate_limiter::TokenBucket;
use meshbridge_device::DevicePort;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is full")]
    QueueFull,
}

/// Outcome of `CommandQueue::enqueue`.
pub enum EnqueueOutcome {
    /// A fresh command was accepted at `info.position`.
    Enqueued(QueueInfo),
    /// An identical in-flight command already exists; `waiter` resolves to
    /// its eventual result (`None` if it completed in the race window
    /// between the debounce check and `add_waiter`).
    Duplicate { info: QueueInfo, waiter: Option<oneshot::Receiver<CommandResult>> },
    /// An identical command already completed before this request arrived;
    /// its cached result is returned immediately, no waiter needed.
    DuplicateCompleted(CommandResult),
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    debounced: AtomicU64,
    rejected: AtomicU64,
}

pub struct CommandQueue {
    max_size: usize,
    full_behavior: QueueFullBehavior,
    rate_limit_per_second: f64,
    deque: Mutex<VecDeque<QueuedCommand>>,
    notify: Notify,
    debouncer: Debouncer,
    rate_limiter: TokenBucket,
    counters: Counters,
}

impl CommandQueue {
    pub fn new(
        max_size: usize,
        full_behavior: QueueFullBehavior,
        rate_limit_per_second: f64,
        debouncer: Debouncer,
        rate_limiter: TokenBucket,
    ) -> Arc<Self> {
        Arc::new(Self {
            max_size,
            full_behavior,
            rate_limit_per_second,
            deque: Mutex::new(VecDeque::with_capacity(max_size)),
            notify: Notify::new(),
            debouncer,
            rate_limiter,
            counters: Counters::default(),
        })
    }

    fn estimate_wait(&self, position: usize) -> f64 {
        if self.rate_limiter.available_tokens() < 0.0 || self.rate_limit_per_second <= 0.0 {
            0.0
        } else {
            position as f64 / self.rate_limit_per_second
        }
    }

    /// Enqueue a command, applying debounce then backpressure. Never blocks.
    pub fn enqueue(
        &self,
        command_type: CommandType,
        params: serde_json::Value,
        request_id: String,
        now_unix: i64,
    ) -> Result<EnqueueOutcome, QueueError> {
        let (is_duplicate, hash, original_time) = self.debouncer.check_duplicate(command_type, &params, now_unix);
        if is_duplicate {
            self.counters.debounced.fetch_add(1, Ordering::Relaxed);
            if let Some(result) = self.debouncer.get_cached_result(&hash) {
                return Ok(EnqueueOutcome::DuplicateCompleted(result));
            }
            let waiter = self.debouncer.add_waiter(&hash);
            return Ok(EnqueueOutcome::Duplicate {
                info: QueueInfo {
                    position: 0,
                    estimated_wait_seconds: 0.0,
                    queue_size: self.len(),
                    debounced: true,
                    original_request_time: original_time,
                },
                waiter,
            });
        }

        let command = QueuedCommand { command_type, params, request_id: request_id.clone(), enqueued_at: now_unix };
        let mut deque = self.deque.lock();
        if deque.len() >= self.max_size {
            match self.full_behavior {
                QueueFullBehavior::Reject => {
                    self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                    self.debouncer.mark_completed(&hash, CommandResult::failed(request_id, "queue full", now_unix));
                    return Err(QueueError::QueueFull);
                }
                QueueFullBehavior::DropOldest => {
                    if let Some(evicted) = deque.pop_front() {
                        self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(request_id = %evicted.request_id, "dropping oldest queued command to make room");
                        let evicted_hash = hash_command(evicted.command_type, &evicted.params);
                        self.debouncer.mark_completed(
                            &evicted_hash,
                            CommandResult::failed(evicted.request_id, "evicted: queue full", now_unix),
                        );
                    }
                }
            }
        }
        deque.push_back(command);
        let position = deque.len();
        drop(deque);
        self.notify.notify_one();

        Ok(EnqueueOutcome::Enqueued(QueueInfo {
            position,
            estimated_wait_seconds: self.estimate_wait(position),
            queue_size: self.len(),
            debounced: false,
            original_request_time: None,
        }))
    }

    pub fn len(&self) -> usize {
        self.deque.lock().len()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queue_size: self.len(),
            commands_processed_total: self.counters.processed.load(Ordering::Relaxed),
            commands_failed_total: self.counters.failed.load(Ordering::Relaxed),
            commands_dropped_total: self.counters.dropped.load(Ordering::Relaxed),
            commands_debounced_total: self.counters.debounced.load(Ordering::Relaxed),
            commands_rejected_total: self.counters.rejected.load(Ordering::Relaxed),
            debounce_cache_size: self.debouncer.cache_size(),
        }
    }

    async fn dequeue(&self) -> QueuedCommand {
        loop {
            if let Some(cmd) = self.deque.lock().pop_front() {
                return cmd;
            }
            self.notify.notified().await;
        }
    }

    pub fn sweep_debounce_cache(&self) {
        self.debouncer.sweep_expired();
    }

    /// Run the single worker loop until `shutdown` fires.
    pub async fn run_worker(
        self: Arc<Self>,
        device: Arc<dyn DevicePort>,
        mut shutdown: broadcast::Receiver<()>,
        now_unix: impl Fn() -> i64,
    ) {
        loop {
            let command = tokio::select! {
                cmd = self.dequeue() => cmd,
                _ = shutdown.recv() => break,
            };
            self.rate_limiter.acquire(1.0).await;
            let hash = hash_command(command.command_type, &command.params);
            let outcome = dispatch(&*device, &command).await;
            let now = now_unix();
            let result = match outcome {
                Ok(()) => {
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                    CommandResult::ok(command.request_id.clone(), now)
                }
                Err(err) => {
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    CommandResult::failed(command.request_id.clone(), err, now)
                }
            };
            debug!(request_id = %command.request_id, success = result.success, "command executed");
            self.debouncer.mark_completed(&hash, result);
        }
    }
}

async fn dispatch(device: &dyn DevicePort, command: &QueuedCommand) -> Result<(), String> {
    let p = &command.params;
    let destination = || p.get("destination").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let text = || p.get("text").and_then(|v| v.as_str()).unwrap_or("").to_string();
    let text_type = || p.get("text_type").and_then(|v| v.as_str()).unwrap_or("plain").to_string();
    let flood = || p.get("flood").and_then(|v| v.as_bool()).unwrap_or(true);
    let result = match command.command_type {
        CommandType::SendMessage => device.send_message(&destination(), &text(), &text_type()).await,
        CommandType::SendChannelMessage => device.send_channel_message(&text(), flood()).await,
        CommandType::SendAdvert => device.send_advert(flood()).await,
        CommandType::SendTracePath => device.send_trace_path(&destination()).await,
        CommandType::Ping => device.ping(&destination()).await,
        CommandType::SendTelemetryRequest => device.send_telemetry_request(&destination()).await,
    };
    result.map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbridge_device::mock::{MockConfig, MockDevicePort};
    use std::collections::HashSet;
    use std::time::Duration;

    fn queue(max_size: usize, behavior: QueueFullBehavior) -> Arc<CommandQueue> {
        let debouncer = Debouncer::new(Duration::from_secs(5), 1000, HashSet::new(), false);
        let limiter = TokenBucket::new(0.0, 0.0, false);
        CommandQueue::new(max_size, behavior, 0.0, debouncer, limiter)
    }

    #[test]
    fn enqueue_past_capacity_rejects() {
        let q = queue(1, QueueFullBehavior::Reject);
        assert!(matches!(
            q.enqueue(CommandType::Ping, serde_json::json!({}), "r1".into(), 0),
            Ok(EnqueueOutcome::Enqueued(_))
        ));
        assert!(matches!(
            q.enqueue(CommandType::Ping, serde_json::json!({"x": 1}), "r2".into(), 0),
            Err(QueueError::QueueFull)
        ));
    }

    #[test]
    fn enqueue_past_capacity_drops_oldest() {
        let q = queue(1, QueueFullBehavior::DropOldest);
        q.enqueue(CommandType::Ping, serde_json::json!({}), "r1".into(), 0).unwrap();
        let outcome = q.enqueue(CommandType::Ping, serde_json::json!({"x": 1}), "r2".into(), 0).unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Enqueued(_)));
        assert_eq!(q.len(), 1);
        assert_eq!(q.stats().commands_dropped_total, 1);
    }

    #[test]
    fn enqueue_positions_are_one_based() {
        let q = queue(10, QueueFullBehavior::Reject);
        let first = q.enqueue(CommandType::Ping, serde_json::json!({"destination": "aa"}), "r1".into(), 0).unwrap();
        let second = q.enqueue(CommandType::Ping, serde_json::json!({"destination": "bb"}), "r2".into(), 0).unwrap();
        match first {
            EnqueueOutcome::Enqueued(info) => assert_eq!(info.position, 1),
            _ => panic!("expected Enqueued"),
        }
        match second {
            EnqueueOutcome::Enqueued(info) => assert_eq!(info.position, 2),
            _ => panic!("expected Enqueued"),
        }
    }

    #[test]
    fn duplicate_of_completed_command_returns_cached_result() {
        let debouncer = Debouncer::new(Duration::from_secs(5), 1000, HashSet::from([CommandType::SendMessage]), true);
        let limiter = TokenBucket::new(0.0, 0.0, false);
        let q = CommandQueue::new(10, QueueFullBehavior::Reject, 0.0, debouncer, limiter);
        let params = serde_json::json!({"destination": "aa", "text": "hi"});
        q.enqueue(CommandType::SendMessage, params.clone(), "r1".into(), 0).unwrap();
        let hash = hash_command(CommandType::SendMessage, &params);
        q.debouncer.mark_completed(&hash, CommandResult::ok("r1", 5));

        let outcome = q.enqueue(CommandType::SendMessage, params, "r2".into(), 1).unwrap();
        match outcome {
            EnqueueOutcome::DuplicateCompleted(result) => assert_eq!(result.request_id, "r1"),
            _ => panic!("expected DuplicateCompleted"),
        }
    }

    #[tokio::test]
    async fn worker_processes_enqueued_command() {
        let q = queue(10, QueueFullBehavior::Reject);
        let device: Arc<dyn DevicePort> = MockDevicePort::new(MockConfig::default());
        device.connect().await.unwrap();
        q.enqueue(CommandType::SendAdvert, serde_json::json!({}), "r1".into(), 0).unwrap();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = tokio::spawn(CommandQueue::run_worker(q.clone(), device, shutdown_rx, || 0));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = shutdown_tx.send(());
        worker.await.unwrap();
        assert_eq!(q.stats().commands_processed_total, 1);
    }
}
