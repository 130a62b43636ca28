//! Floorplan update queue: a bounded FIFO hand-off from the network task to the applier.
//!
//! The queue has exactly one consumer ([`UpdateReceiver`]). Producers enqueue through
//! [`Producer`] handles and block when the queue is full; that stall is the only
//! backpressure in the pipeline. Only the owner of the [`UpdateQueue`] closes it, and it
//! must do so after every producer has stopped.

#![forbid(unsafe_code)]

use floorplan_core::EntityState;
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_CAPACITY: usize = 100;

/// Why an enqueue did not happen. The rejected record is handed back.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("stop signal raised before enqueue")]
    Stopped(EntityState),
    #[error("update queue closed")]
    Closed(EntityState),
}

impl SendError {
    pub fn into_inner(self) -> EntityState {
        match self {
            SendError::Stopped(s) | SendError::Closed(s) => s,
        }
    }
}

/// Owning side of the queue. Hands out producers and closes the queue once.
#[derive(Debug)]
pub struct UpdateQueue {
    tx: Option<mpsc::Sender<EntityState>>,
    cap: usize,
}

impl UpdateQueue {
    pub fn with_capacity(cap: usize) -> (Self, UpdateReceiver) {
        let (queue, _producer, rx) = Self::open(cap);
        (queue, rx)
    }

    /// Queue plus its first producer. Capacity is at least one.
    pub fn open(cap: usize) -> (Self, Producer, UpdateReceiver) {
        let cap = cap.max(1);
        let (tx, rx) = mpsc::channel(cap);
        let producer = Producer { tx: tx.clone() };
        (Self { tx: Some(tx), cap }, producer, UpdateReceiver { rx })
    }

    pub fn capacity(&self) -> usize { self.cap }

    pub fn is_closed(&self) -> bool { self.tx.is_none() }

    /// New producer handle, or `None` once the queue has been closed.
    pub fn producer(&self) -> Option<Producer> {
        self.tx.as_ref().map(|tx| Producer { tx: tx.clone() })
    }

    /// Close the queue. Returns `true` the first time, `false` on every later call.
    ///
    /// The consumer sees end-of-queue once all producers handed out earlier are dropped too.
    pub fn close(&mut self) -> bool {
        match self.tx.take() {
            Some(tx) => {
                drop(tx);
                debug!(cap = self.cap, "update queue closed");
                true
            }
            None => false,
        }
    }
}

/// Cloneable enqueue handle.
#[derive(Debug, Clone)]
pub struct Producer {
    tx: mpsc::Sender<EntityState>,
}

impl Producer {
    /// Enqueue in FIFO order, waiting for room if the queue is full.
    ///
    /// The wait races `stop`, so a raised stop signal is observed even while the consumer
    /// is stalled.
    pub async fn send(&self, state: EntityState, stop: &CancellationToken) -> Result<(), SendError> {
        if stop.is_cancelled() {
            return Err(SendError::Stopped(state));
        }
        let permit = tokio::select! {
            biased;
            _ = stop.cancelled() => return Err(SendError::Stopped(state)),
            permit = self.tx.reserve() => permit,
        };
        match permit {
            Ok(permit) => {
                permit.send(state);
                counter!("floorplan_queue_enqueued_total", 1u64);
                Ok(())
            }
            Err(_) => Err(SendError::Closed(state)),
        }
    }
}

/// The single consuming side.
#[derive(Debug)]
pub struct UpdateReceiver {
    rx: mpsc::Receiver<EntityState>,
}

impl UpdateReceiver {
    /// Next record, or `None` once the queue is closed and drained.
    pub async fn recv(&mut self) -> Option<EntityState> { self.rx.recv().await }
}
