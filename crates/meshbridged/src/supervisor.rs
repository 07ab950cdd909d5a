//! Lifecycle supervisor: brings up storage, the command pipeline, the
//! device port, and the event normalizer in dependency order, then hosts
//! the HTTP query/command API until a shutdown signal arrives.
//!
//! Startup order: Store -> command pipeline worker + debounce sweeper ->
//! device port connect -> normalizer subscribed to the device's event
//! stream -> retention sweeper. Shutdown runs the same steps in reverse.

use crate::api;
use crate::config::Config;
use crate::normalizer::Normalizer;
use crate::store::{Store, StoreError};
use meshbridge_device::live::LiveSerialPort;
use meshbridge_device::mock::{MockConfig, MockDevicePort};
use meshbridge_device::DevicePort;
use meshbridge_queue::{CommandQueue, Debouncer, QueueStats, TokenBucket};
use meshbridge_webhook::{validate_jsonpath, WebhookConfig, WebhookDispatcher, WebhookRoute};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),
    #[error("device error: {0}")]
    Device(#[from] meshbridge_device::DeviceError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("scenario file error: {0}")]
    Scenario(String),
}

/// Shared state handed to every axum handler.
pub struct AppState {
    pub store: Arc<Store>,
    pub queue: Arc<CommandQueue>,
    pub device: Arc<dyn DevicePort>,
    pub bearer_token: Option<String>,
    pub enable_write: bool,
    pub queue_timeout_seconds: f64,
    pub metrics_handle: Option<PrometheusHandle>,
    pub now_unix: fn() -> i64,
}

fn now_unix() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn load_scenario(path: &std::path::Path) -> Result<meshbridge_device::scenarios::Scenario, SupervisorError> {
    let raw = std::fs::read_to_string(path).map_err(|e| SupervisorError::Scenario(e.to_string()))?;
    serde_json::from_str(&raw).map_err(|e| SupervisorError::Scenario(e.to_string()))
}

fn build_device(config: &Config) -> Result<Arc<dyn DevicePort>, SupervisorError> {
    if config.mock_mode {
        let scenario = match &config.mock_scenario {
            Some(path) => Some(load_scenario(path)?),
            None => None,
        };
        let mock_config = MockConfig {
            scenario,
            loop_scenario: config.mock_loop_scenario,
            num_nodes: config.mock_num_nodes,
            min_interval: Duration::from_secs_f64(config.mock_min_interval),
            max_interval: Duration::from_secs_f64(config.mock_max_interval),
            center_lat: config.mock_center_lat,
            center_lon: config.mock_center_lon,
            gps_radius_km: config.mock_gps_radius_km,
        };
        Ok(MockDevicePort::new(mock_config))
    } else {
        Ok(LiveSerialPort::new(config.serial_port.clone(), config.baud_rate))
    }
}

fn build_webhook(config: &Config) -> WebhookDispatcher {
    let route = |url: &Option<String>, jsonpath: &str| {
        url.as_ref().map(|url| WebhookRoute { url: url.clone(), jsonpath: validate_jsonpath(jsonpath) })
    };
    WebhookDispatcher::new(WebhookConfig {
        contact_message: route(&config.webhook_message_direct_url, &config.webhook_message_direct_jsonpath),
        channel_message: route(&config.webhook_message_channel_url, &config.webhook_message_channel_jsonpath),
        advertisement: route(&config.webhook_advertisement_url, &config.webhook_advertisement_jsonpath),
        timeout: config.webhook_timeout(),
        retry_count: config.webhook_retry_count,
    })
}

fn debounced_command_set(config: &Config) -> HashSet<meshbridge_queue::CommandType> {
    use std::str::FromStr;
    config.debounce_commands.iter().filter_map(|s| meshbridge_queue::CommandType::from_str(s).ok()).collect()
}

fn silent_event_kind_set(config: &Config) -> HashSet<meshbridge_core::EventKind> {
    config.silent_event_kinds.iter().filter_map(|s| meshbridge_core::EventKind::parse(s)).collect()
}

pub struct Supervisor {
    config: Config,
    store: Arc<Store>,
    device: Arc<dyn DevicePort>,
    queue: Arc<CommandQueue>,
    normalizer: Arc<Normalizer>,
    metrics_handle: Option<PrometheusHandle>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Supervisor {
    pub fn new(config: Config) -> Result<Self, SupervisorError> {
        let store = Arc::new(Store::open(&config.db_path)?);
        let device = build_device(&config)?;

        let debouncer = Debouncer::new(
            Duration::from_secs_f64(config.debounce_window_seconds),
            config.debounce_cache_max_size,
            debounced_command_set(&config),
            config.debounce_enabled,
        );
        let rate_limiter =
            TokenBucket::new(config.rate_limit_per_second, config.rate_limit_burst, config.rate_limit_enabled);
        let queue = CommandQueue::new(
            config.queue_max_size,
            config.queue_full_behavior(),
            config.rate_limit_per_second,
            debouncer,
            rate_limiter,
        );

        let webhook = Arc::new(build_webhook(&config));
        let normalizer = Arc::new(Normalizer::new(store.clone(), webhook, silent_event_kind_set(&config)));

        let metrics_handle = if config.metrics_enabled {
            Some(PrometheusBuilder::new().install_recorder().map_err(|e| SupervisorError::Scenario(e.to_string()))?)
        } else {
            None
        };

        let (shutdown_tx, _) = broadcast::channel(4);

        Ok(Self { config, store, device, queue, normalizer, metrics_handle, shutdown_tx })
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Start every background task and serve the HTTP API until shutdown.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        info!(db_path = %self.config.db_path.display(), "starting meshbridged");

        let queue_worker = tokio::spawn({
            let queue = self.queue.clone();
            let device = self.device.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            async move { queue.run_worker(device, shutdown_rx, now_unix).await }
        });

        let debounce_sweeper = self.spawn_debounce_sweeper();

        self.device.connect().await?;
        info!("device port connected");

        let normalizer_task = tokio::spawn({
            let normalizer = self.normalizer.clone();
            let events = self.device.subscribe();
            async move { normalizer.run(events, now_unix).await }
        });

        let retention_sweeper = self.spawn_retention_sweeper();

        let app_state = Arc::new(AppState {
            store: self.store.clone(),
            queue: self.queue.clone(),
            device: self.device.clone(),
            bearer_token: self.config.bearer_token.clone(),
            enable_write: self.config.enable_write,
            queue_timeout_seconds: self.config.queue_timeout_seconds,
            metrics_handle: self.metrics_handle.clone(),
            now_unix,
        });
        let addr = SocketAddr::new(self.config.api_host, self.config.api_port);
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!(%addr, "HTTP API listening");

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let serve = axum::serve(listener, api::router(app_state)).with_graceful_shutdown(async move {
            let _ = shutdown_rx.recv().await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "HTTP server exited with error");
        }

        // Shutdown in reverse order: retention -> normalizer -> device -> debounce -> queue.
        retention_sweeper.abort();
        normalizer_task.abort();
        if let Err(e) = self.device.disconnect().await {
            warn!(error = %e, "error disconnecting device during shutdown");
        }
        debounce_sweeper.abort();
        let _ = queue_worker.await;
        self.store.flush()?;

        Ok(())
    }

    fn spawn_debounce_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.queue.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = ticker.tick() => queue.sweep_debounce_cache(),
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    fn spawn_retention_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let retention_days = self.config.retention_days as i64;
        let interval = self.config.cleanup_interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let cutoff = now_unix() - retention_days * 86_400;
                        match store.sweep_retention(cutoff) {
                            Ok(counts) => info!(?counts, "retention sweep complete"),
                            Err(e) => error!(error = %e, "retention sweep failed"),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn test_config(dir: &std::path::Path) -> Config {
        let mut config = Config::parse_from(["meshbridged", "--mock-mode"]);
        config.db_path = dir.to_path_buf();
        config.api_port = 0;
        config.metrics_enabled = false;
        config
    }

    #[tokio::test]
    async fn supervisor_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = Supervisor::new(test_config(dir.path())).unwrap();
        supervisor.shutdown();
        assert_eq!(supervisor.stats().queue_size, 0);
    }
}
