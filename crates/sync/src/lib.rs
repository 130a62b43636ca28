//! Floorplan sync engine: keeps the renderer in step with remote entity state.
//!
//! Three tasks take part: the network task ([`SyncLoop`]), the applier consuming the update
//! queue, and the owner ([`Engine`]) holding the stop signal. Shutdown raises the signal,
//! joins the network task, closes the queue and then joins the applier.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use floorplan_core::ConnectionState;
use floorplan_hass::StateSource;
use floorplan_queue::{UpdateQueue, DEFAULT_CAPACITY};
use floorplan_render::{Applier, ApplierStats};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod sync_loop;

pub use sync_loop::SyncLoop;

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(10);

/// Engine tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Identifies this engine in logs.
    pub name: String,
    pub reconnect_delay: Duration,
    pub queue_capacity: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { name: "floorplan".into(), reconnect_delay: DEFAULT_RECONNECT_DELAY, queue_capacity: DEFAULT_CAPACITY }
    }
}

impl SyncConfig {
    /// Defaults overridden by `FLOORPLAN_RECONNECT_SECS` and `FLOORPLAN_QUEUE_CAP`.
    pub fn from_env() -> Self { Self::default().apply_env() }

    pub fn apply_env(mut self) -> Self {
        if let Some(secs) = std::env::var("FLOORPLAN_RECONNECT_SECS").ok().and_then(|s| s.parse::<u64>().ok()) {
            self.reconnect_delay = Duration::from_secs(secs);
        }
        if let Some(cap) = std::env::var("FLOORPLAN_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()) {
            self.queue_capacity = cap;
        }
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_queue_capacity(mut self, cap: usize) -> Self {
        self.queue_capacity = cap;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("{task} task failed: {source}")]
    Task { task: &'static str, #[source] source: JoinError },
}

/// Running engine. Owns the stop signal and the update queue.
pub struct Engine {
    name: String,
    stop: CancellationToken,
    queue: UpdateQueue,
    network: Option<JoinHandle<()>>,
    consumer: Option<JoinHandle<ApplierStats>>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Engine {
    /// Spawn the network task and the applier. Must be called inside a tokio runtime.
    pub fn start(source: Arc<dyn StateSource>, applier: Applier, cfg: SyncConfig) -> Self {
        let stop = CancellationToken::new();
        let (queue, producer, rx) = UpdateQueue::open(cfg.queue_capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Idle);

        info!(name = %cfg.name, cap = queue.capacity(), delay_ms = %cfg.reconnect_delay.as_millis(), "engine starting");
        let consumer = tokio::spawn(applier.run(rx));
        let sync = SyncLoop::new(cfg.name.clone(), source, producer, stop.clone(), cfg.reconnect_delay, state_tx);
        let network = tokio::spawn(sync.run());

        Self { name: cfg.name, stop, queue, network: Some(network), consumer: Some(consumer), state_rx }
    }

    /// Clone of the stop signal. Raising it is idempotent.
    pub fn stop_signal(&self) -> CancellationToken { self.stop.clone() }

    /// Raise the stop signal without waiting.
    pub fn stop(&self) { self.stop.cancel(); }

    pub fn state(&self) -> watch::Receiver<ConnectionState> { self.state_rx.clone() }

    /// Stop and wait for full teardown; returns the applier counters.
    pub async fn shutdown(mut self) -> Result<ApplierStats, EngineError> {
        info!(name = %self.name, "engine stopping");
        self.stop.cancel();

        let network_res = match self.network.take() {
            Some(h) => h.await,
            None => Ok(()),
        };
        // No producer survives the network task, so this really closes the queue.
        self.queue.close();

        let consumer_res = match self.consumer.take() {
            Some(h) => h.await,
            None => Ok(ApplierStats::default()),
        };

        if let Err(e) = network_res {
            error!(name = %self.name, error = %e, "network task failed");
            return Err(EngineError::Task { task: "network", source: e });
        }
        let stats = consumer_res.map_err(|e| EngineError::Task { task: "applier", source: e })?;
        info!(name = %self.name, applied = stats.applied, "engine stopped");
        Ok(stats)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        // Dropped without shutdown(): let the tasks unwind on their own.
        self.stop.cancel();
    }
}
