//! Floorplan hass client: state snapshot and live event stream against a Home Assistant API.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use floorplan_core::{DomainFilter, EntityState};
use metrics::{counter, histogram};
use reqwest::{header, StatusCode, Url};
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod stream;

pub use reqwest::StatusCode as HttpStatus;
pub use stream::PumpEnd;

const STATES_PATH: &str = "api/states";
const STREAM_PATH: &str = "api/stream";
const API_PATH: &str = "api/";

/// Buffer between the stream pump and its reader.
pub const STREAM_BUFFER: usize = 10;
pub const DEFAULT_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum HassError {
    #[error("invalid home assistant url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("sending request: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("authentication rejected: {status}")]
    Auth { status: StatusCode },
    #[error("unexpected response code: {status}")]
    Protocol { status: StatusCode },
    #[error("parsing response data: {0}")]
    Decode(#[source] serde_json::Error),
}

/// `{entity_id, state}` as reported by the remote, before normalization. Either may be null.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RemoteState {
    #[serde(default)]
    entity_id: Option<String>,
    #[serde(default)]
    state: Option<String>,
}

impl RemoteState {
    pub(crate) fn entity_id(&self) -> &str { self.entity_id.as_deref().unwrap_or_default() }
    pub(crate) fn state(&self) -> &str { self.state.as_deref().unwrap_or_default() }
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
}

/// Cancellation handle for an open event stream.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    pub fn new(tx: oneshot::Sender<()>) -> Self { Self { tx: Some(tx) } }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() { let _ = tx.send(()); }
    }
}

/// An open event stream: records arrive on `rx` until it yields `None`.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

/// Where the sync loop gets its records from.
#[async_trait::async_trait]
pub trait StateSource: Send + Sync {
    /// One-shot read of every current entity state.
    async fn snapshot(&self) -> Result<Vec<EntityState>, HassError>;

    /// Open the live feed. The returned sequence ends on close, read error, or a bad frame;
    /// the connection is released when it ends, when the handle is dropped, or when `stop` fires.
    async fn stream(&self, stop: &CancellationToken) -> Result<StreamHandle<EntityState>, HassError>;
}

/// Home Assistant REST client.
#[derive(Debug, Clone)]
pub struct HassClient {
    base: Url,
    token: String,
    http: reqwest::Client,
    filter: DomainFilter,
    snapshot_timeout: Duration,
}

impl HassClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, HassError> {
        // Relative joins need a trailing slash to keep any path prefix of the base.
        let mut raw = base_url.trim().to_string();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw).map_err(|e| HassError::InvalidUrl { url: base_url.to_string(), reason: e.to_string() })?;
        if base.cannot_be_a_base() || !matches!(base.scheme(), "http" | "https") {
            return Err(HassError::InvalidUrl { url: base_url.to_string(), reason: "expected an http(s) base url".into() });
        }
        Ok(Self {
            base,
            token: token.into(),
            http: reqwest::Client::new(),
            filter: DomainFilter::allow_all(),
            snapshot_timeout: DEFAULT_SNAPSHOT_TIMEOUT,
        })
    }

    pub fn with_domain_filter(mut self, filter: DomainFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_snapshot_timeout(mut self, timeout: Duration) -> Self {
        self.snapshot_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url { &self.base }

    fn endpoint(&self, path: &str) -> Result<Url, HassError> {
        self.base
            .join(path)
            .map_err(|e| HassError::InvalidUrl { url: format!("{}{}", self.base, path), reason: e.to_string() })
    }

    /// Probe `api/` and return the server's status message.
    pub async fn check_api(&self) -> Result<String, HassError> {
        let url = self.endpoint(API_PATH)?;
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .timeout(self.snapshot_timeout)
            .send()
            .await
            .map_err(HassError::Transport)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(HassError::Transport)?;
        check_status(status)?;
        let api: ApiStatus = serde_json::from_slice(&body).map_err(HassError::Decode)?;
        info!(message = %api.message, "hass: api reachable");
        Ok(api.message)
    }

    /// Fetch every entity state, normalized, in server order.
    pub async fn snapshot(&self) -> Result<Vec<EntityState>, HassError> {
        let t0 = Instant::now();
        let url = self.endpoint(STATES_PATH)?;
        debug!(url = %url, "hass: snapshot start");
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .timeout(self.snapshot_timeout)
            .send()
            .await
            .map_err(HassError::Transport)?;
        let status = resp.status();
        // Always read the body to completion so the connection goes back to the pool.
        let body = resp.bytes().await.map_err(HassError::Transport)?;
        check_status(status)?;
        let rows: Vec<RemoteState> = serde_json::from_slice(&body).map_err(HassError::Decode)?;

        let total = rows.len();
        let mut out = Vec::with_capacity(total);
        for row in rows {
            if !self.filter.admits(row.entity_id()) {
                continue;
            }
            match EntityState::from_remote(row.entity_id(), row.state()) {
                Ok(s) => out.push(s),
                Err(e) => warn!(error = %e, "hass: snapshot row skipped"),
            }
        }
        let took_ms = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("floorplan_snapshot_ms", took_ms);
        info!(rows = total, kept = out.len(), took_ms = %t0.elapsed().as_millis(), "hass: snapshot ok");
        Ok(out)
    }

    /// Open `api/stream` and pump decoded state changes into a bounded channel.
    pub async fn stream(&self, stop: &CancellationToken) -> Result<StreamHandle<EntityState>, HassError> {
        let url = self.endpoint(STREAM_PATH)?;
        debug!(url = %url, "hass: stream connect");
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .header(header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(HassError::Transport)?;
        check_status(resp.status())?;
        counter!("floorplan_stream_connects_total", 1u64);

        let (tx, rx) = mpsc::channel::<EntityState>(STREAM_BUFFER);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let stop = stop.clone();
        let filter = self.filter.clone();
        tokio::spawn(async move {
            // The response (and its connection) is dropped when the pump returns.
            let _ = stream::pump_events(resp.bytes_stream(), tx, cancel_rx, stop, filter).await;
        });
        info!("hass: stream opened");
        Ok(StreamHandle { rx, cancel: CancelHandle::new(cancel_tx) })
    }
}

fn check_status(status: StatusCode) -> Result<(), HassError> {
    match status {
        s if s.is_success() => Ok(()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(HassError::Auth { status }),
        _ => Err(HassError::Protocol { status }),
    }
}

#[async_trait::async_trait]
impl StateSource for HassClient {
    async fn snapshot(&self) -> Result<Vec<EntityState>, HassError> {
        HassClient::snapshot(self).await
    }

    async fn stream(&self, stop: &CancellationToken) -> Result<StreamHandle<EntityState>, HassError> {
        HassClient::stream(self, stop).await
    }
}
