use std::sync::Arc;
use std::time::{Duration, Instant};

use floorplan_core::{ConnectionState, EntityState};
use floorplan_hass::{StateSource, StreamHandle};
use floorplan_queue::Producer;
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// The network-facing task: snapshot, then stream, resync and reconnect until stopped.
///
/// Only one producer is ever active: a pending resync is joined before the next stream
/// opens and before the loop exits.
pub struct SyncLoop {
    name: String,
    source: Arc<dyn StateSource>,
    producer: Producer,
    stop: CancellationToken,
    delay: Duration,
    state_tx: watch::Sender<ConnectionState>,
}

impl SyncLoop {
    pub fn new(
        name: impl Into<String>,
        source: Arc<dyn StateSource>,
        producer: Producer,
        stop: CancellationToken,
        delay: Duration,
        state_tx: watch::Sender<ConnectionState>,
    ) -> Self {
        Self { name: name.into(), source, producer, stop, delay, state_tx }
    }

    fn set_state(&self, next: ConnectionState) {
        let prev = self.state_tx.send_replace(next);
        if prev != next {
            debug!(name = %self.name, from = %prev, to = %next, "connection state");
        }
    }

    pub async fn run(self) {
        self.set_state(ConnectionState::Syncing);
        info!(name = %self.name, "fetching state data");
        sync_states(self.source.clone(), self.producer.clone(), self.stop.clone()).await;

        let mut resync: Option<JoinHandle<usize>> = None;
        loop {
            self.join_resync(resync.take()).await;
            if self.stop.is_cancelled() {
                break;
            }

            info!(name = %self.name, "listening for event data");
            let opened = tokio::select! {
                _ = self.stop.cancelled() => break,
                res = self.source.stream(&self.stop) => res,
            };
            match opened {
                Ok(handle) => {
                    self.set_state(ConnectionState::Streaming);
                    let t0 = Instant::now();
                    let forwarded = self.read_states(handle).await;
                    info!(name = %self.name, forwarded, took_ms = %t0.elapsed().as_millis(), "event stream ended");
                }
                Err(e) => {
                    counter!("floorplan_stream_failures_total", 1u64);
                    error!(name = %self.name, error = %e, "error listening to events");
                }
            }
            if self.stop.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Reconnecting);
            // Keep the view fresh while there is no live feed; the delay does not wait for it.
            resync = Some(tokio::spawn(sync_states(self.source.clone(), self.producer.clone(), self.stop.clone())));
            if !self.wait_delay().await {
                break;
            }
            counter!("floorplan_stream_reconnects_total", 1u64);
            info!(name = %self.name, "reconnecting to event stream");
        }

        self.join_resync(resync.take()).await;
        self.set_state(ConnectionState::Stopped);
        info!(name = %self.name, "sync loop stopped");
    }

    async fn join_resync(&self, pending: Option<JoinHandle<usize>>) {
        let Some(h) = pending else { return };
        match h.await {
            Ok(queued) => debug!(name = %self.name, queued, "resync finished"),
            Err(e) => error!(name = %self.name, error = %e, "resync task failed"),
        }
    }

    /// Forward records until the stream ends or stop is raised. Returns how many were queued.
    async fn read_states(&self, handle: StreamHandle<EntityState>) -> usize {
        let StreamHandle { mut rx, cancel } = handle;
        let mut forwarded = 0usize;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                next = rx.recv() => next,
            };
            let Some(state) = next else { break };
            if self.producer.send(state, &self.stop).await.is_err() {
                break;
            }
            forwarded += 1;
        }
        cancel.cancel();
        forwarded
    }

    /// Sleep for the reconnect delay. `false` if stop was raised first.
    async fn wait_delay(&self) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(self.delay) => true,
        }
    }
}

/// Fetch a snapshot and enqueue it in order. Failures are logged and otherwise ignored.
pub(crate) async fn sync_states(source: Arc<dyn StateSource>, producer: Producer, stop: CancellationToken) -> usize {
    let res = tokio::select! {
        _ = stop.cancelled() => return 0,
        res = source.snapshot() => res,
    };
    let states = match res {
        Ok(states) => states,
        Err(e) => {
            counter!("floorplan_snapshot_failures_total", 1u64);
            error!(error = %e, "error fetching states");
            return 0;
        }
    };
    let total = states.len();
    let mut queued = 0usize;
    for state in states {
        if producer.send(state, &stop).await.is_err() {
            break;
        }
        queued += 1;
    }
    debug!(total, queued, "snapshot enqueued");
    queued
}
