//! Line-oriented decoding of the `api/stream` event feed.

use bytes::BytesMut;
use floorplan_core::{DomainFilter, EntityState};
use futures::StreamExt;
use metrics::counter;
use serde::Deserialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::RemoteState;

const DATA_PREFIX: &[u8] = b"data: ";
const HEARTBEAT: &[u8] = b"ping";
const STATE_CHANGED: &str = "state_changed";
/// Longest line kept pending while waiting for its newline.
pub(crate) const MAX_LINE: usize = 1 << 20;

/// Only `event_type` is read eagerly; `data` is decoded for tracked events only.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(default)]
    event_type: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Default, Deserialize)]
struct EventData {
    #[serde(default)]
    new_state: Option<RemoteState>,
}

/// What a single line of the feed turned out to be.
#[derive(Debug)]
pub(crate) enum Frame {
    /// Not a data line, a heartbeat, or an event we do not track.
    Skip,
    State(RemoteState),
    Malformed(serde_json::Error),
}

pub(crate) fn decode_line(line: &[u8]) -> Frame {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let Some(payload) = line.strip_prefix(DATA_PREFIX) else { return Frame::Skip };
    if payload == HEARTBEAT {
        return Frame::Skip;
    }
    let ev = match serde_json::from_slice::<StreamEvent>(payload) {
        Ok(ev) => ev,
        Err(e) => return Frame::Malformed(e),
    };
    if ev.event_type.as_deref() != Some(STATE_CHANGED) {
        return Frame::Skip;
    }
    match serde_json::from_value::<Option<EventData>>(ev.data) {
        Err(e) => Frame::Malformed(e),
        Ok(Some(EventData { new_state: Some(s) })) => Frame::State(s),
        // Entity removed; nothing to render.
        Ok(_) => Frame::Skip,
    }
}

/// Why the pump stopped. The caller only sees the channel closing; this is for logs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PumpEnd {
    /// Remote closed the connection.
    Closed,
    ReadError,
    /// A data line could not be decoded, or grew past [`MAX_LINE`]; the feed is abandoned.
    Malformed,
    /// Stop signal raised or the handle was cancelled/dropped.
    Cancelled,
    /// Receiver went away.
    ReceiverGone,
}

/// Split a byte stream into lines and forward decoded state changes into `tx`.
///
/// Forwarding waits for room in `tx` rather than dropping records. Only complete,
/// newline-terminated lines are decoded; a partial tail at end of stream is discarded.
pub(crate) async fn pump_events<S, E>(
    stream: S,
    tx: mpsc::Sender<EntityState>,
    mut cancel_rx: oneshot::Receiver<()>,
    stop: CancellationToken,
    filter: DomainFilter,
) -> PumpEnd
where
    S: futures::Stream<Item = Result<bytes::Bytes, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    let mut buf = BytesMut::new();
    // Bytes of `buf` already known to hold no newline.
    let mut scanned = 0usize;
    let end = 'pump: loop {
        let next = tokio::select! {
            _ = &mut cancel_rx => break 'pump PumpEnd::Cancelled,
            _ = stop.cancelled() => break 'pump PumpEnd::Cancelled,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(chunk)) => {
                buf.extend_from_slice(&chunk);
                loop {
                    let Some(off) = buf[scanned..].iter().position(|&b| b == b'\n') else {
                        scanned = buf.len();
                        break;
                    };
                    let pos = scanned + off;
                    scanned = 0;
                    let line = buf.split_to(pos + 1);
                    let raw = match decode_line(&line[..pos]) {
                        Frame::Skip => continue,
                        Frame::State(raw) => raw,
                        Frame::Malformed(e) => {
                            warn!(error = %e, "malformed event payload; closing stream");
                            break 'pump PumpEnd::Malformed;
                        }
                    };
                    if !filter.admits(raw.entity_id()) {
                        continue;
                    }
                    let state = match EntityState::from_remote(raw.entity_id(), raw.state()) {
                        Ok(s) => s,
                        Err(e) => {
                            debug!(error = %e, "skipping state change without entity id");
                            continue;
                        }
                    };
                    counter!("floorplan_stream_events_total", 1u64);
                    let sent = tokio::select! {
                        _ = &mut cancel_rx => break 'pump PumpEnd::Cancelled,
                        _ = stop.cancelled() => break 'pump PumpEnd::Cancelled,
                        sent = tx.send(state) => sent,
                    };
                    if sent.is_err() {
                        break 'pump PumpEnd::ReceiverGone;
                    }
                }
                if buf.len() > MAX_LINE {
                    warn!(pending = buf.len(), "event line too long; closing stream");
                    break 'pump PumpEnd::Malformed;
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "event stream read error");
                break 'pump PumpEnd::ReadError;
            }
            None => break 'pump PumpEnd::Closed,
        }
    };
    info!(end = ?end, "event pump ended");
    end
}

#[cfg(test)]
mod tests {
    use super::*;
    use floorplan_core::TriState;
    use futures::stream;

    fn changed(id: &str, state: &str) -> String {
        format!(
            "data: {{\"event_type\":\"state_changed\",\"data\":{{\"new_state\":{{\"entity_id\":\"{}\",\"state\":\"{}\"}}}}}}\n",
            id, state
        )
    }

    async fn run_pump(chunks: Vec<String>, filter: DomainFilter) -> (Vec<EntityState>, PumpEnd) {
        let (tx, mut rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let s = stream::iter(chunks.into_iter().map(|c| Ok::<_, std::io::Error>(bytes::Bytes::from(c))));
        let end = pump_events(s, tx, cancel_rx, CancellationToken::new(), filter).await;
        let mut out = Vec::new();
        while let Some(st) = rx.recv().await { out.push(st); }
        (out, end)
    }

    #[test]
    fn non_data_lines_and_heartbeats_are_skipped() {
        assert!(matches!(decode_line(b""), Frame::Skip));
        assert!(matches!(decode_line(b"event: message"), Frame::Skip));
        assert!(matches!(decode_line(b"data: ping"), Frame::Skip));
        assert!(matches!(decode_line(b"data: ping\r"), Frame::Skip));
        assert!(matches!(decode_line(b"data:{}"), Frame::Skip));
    }

    #[test]
    fn other_event_types_are_skipped() {
        let line = br#"data: {"event_type":"call_service","data":{}}"#;
        assert!(matches!(decode_line(line), Frame::Skip));
        let removed = br#"data: {"event_type":"state_changed","data":{"new_state":null}}"#;
        assert!(matches!(decode_line(removed), Frame::Skip));
        let bare = br#"data: {"event_type":"state_changed","data":null}"#;
        assert!(matches!(decode_line(bare), Frame::Skip));
    }

    #[test]
    fn foreign_event_payload_shapes_are_not_decoded() {
        let lines: [&[u8]; 4] = [
            br#"data: {"event_type":"component_loaded","data":null}"#,
            br#"data: {"event_type":"call_service","data":{"new_state":"weird"}}"#,
            br#"data: {"event_type":null}"#,
            br#"data: {"data":[1,2,3]}"#,
        ];
        for line in lines {
            assert!(matches!(decode_line(line), Frame::Skip), "line {:?}", String::from_utf8_lossy(line));
        }
    }

    #[test]
    fn null_state_decodes_as_empty() {
        let line = br#"data: {"event_type":"state_changed","data":{"new_state":{"entity_id":"light.a","state":null}}}"#;
        match decode_line(line) {
            Frame::State(s) => {
                assert_eq!(s.entity_id(), "light.a");
                assert_eq!(s.state(), "");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[tokio::test]
    async fn foreign_null_data_event_keeps_the_stream_open() {
        let chunks = vec![
            changed("light.a", "on"),
            "data: {\"event_type\":\"component_loaded\",\"data\":null}\n".to_string(),
            "data: {\"event_type\":\"state_changed\",\"data\":{\"new_state\":{\"entity_id\":\"light.b\",\"state\":null}}}\n".to_string(),
            changed("light.c", "off"),
        ];
        let (out, end) = run_pump(chunks, DomainFilter::allow_all()).await;
        assert_eq!(end, PumpEnd::Closed);
        let got: Vec<(&str, TriState)> = out.iter().map(|s| (s.id(), s.value())).collect();
        assert_eq!(got, vec![("light.a", TriState::On), ("light.b", TriState::Unknown), ("light.c", TriState::Off)]);
    }

    #[tokio::test]
    async fn endless_line_is_abandoned() {
        let mut chunks = vec![changed("light.a", "on")];
        let junk = "x".repeat(64 * 1024);
        chunks.extend(std::iter::repeat(junk).take(MAX_LINE / (64 * 1024) + 2));
        chunks.push(changed("light.b", "on"));
        let (out, end) = run_pump(chunks, DomainFilter::allow_all()).await;
        assert_eq!(end, PumpEnd::Malformed);
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn newline_found_after_many_small_chunks() {
        let full = changed("switch.fan", "on");
        let chunks: Vec<String> = full.chars().map(|c| c.to_string()).collect();
        let (out, end) = run_pump(chunks, DomainFilter::allow_all()).await;
        assert_eq!(end, PumpEnd::Closed);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id(), "switch.fan");
    }

    #[test]
    fn state_changed_decodes() {
        let line = changed("light.kitchen", "on");
        match decode_line(line.trim_end().as_bytes()) {
            Frame::State(s) => {
                assert_eq!(s.entity_id(), "light.kitchen");
                assert_eq!(s.state(), "on");
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        assert!(matches!(decode_line(b"data: {not json"), Frame::Malformed(_)));
    }

    #[tokio::test]
    async fn lines_split_across_chunks() {
        let full = changed("switch.fan", "off");
        let (head, tail) = full.split_at(20);
        let chunks = vec!["data: ping\n".to_string(), head.to_string(), tail.to_string()];
        let (out, end) = run_pump(chunks, DomainFilter::allow_all()).await;
        assert_eq!(end, PumpEnd::Closed);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id(), "switch.fan");
        assert_eq!(out[0].value(), TriState::Off);
    }

    #[tokio::test]
    async fn malformed_payload_ends_the_stream() {
        let chunks = vec![changed("light.a", "on"), "data: {garbage\n".to_string(), changed("light.b", "on")];
        let (out, end) = run_pump(chunks, DomainFilter::allow_all()).await;
        assert_eq!(end, PumpEnd::Malformed);
        assert_eq!(out.iter().map(|s| s.id()).collect::<Vec<_>>(), vec!["light.a"]);
    }

    #[tokio::test]
    async fn partial_tail_is_discarded() {
        let chunks = vec![changed("light.a", "on"), "data: {\"event_type\":\"state_cha".to_string()];
        let (out, end) = run_pump(chunks, DomainFilter::allow_all()).await;
        assert_eq!(end, PumpEnd::Closed);
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn domain_filter_applies_to_events() {
        let chunks = vec![changed("sensor.temp", "21"), changed("cover.garage", "open")];
        let (out, _) = run_pump(chunks, DomainFilter::new(["cover"])).await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id(), "cover.garage");
        assert_eq!(out[0].value(), TriState::On);
    }

    #[tokio::test]
    async fn stop_ends_an_idle_pump() {
        let (tx, _rx) = mpsc::channel(4);
        let (_cancel_tx, cancel_rx) = oneshot::channel();
        let stop = CancellationToken::new();
        let s = async_stream::stream! {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                yield Ok::<bytes::Bytes, std::io::Error>(bytes::Bytes::from_static(b"data: ping\n"));
            }
        };
        let handle = tokio::spawn(pump_events(s, tx, cancel_rx, stop.clone(), DomainFilter::allow_all()));
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        stop.cancel();
        let end = tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("pump did not stop")
            .unwrap();
        assert_eq!(end, PumpEnd::Cancelled);
    }

    #[tokio::test]
    async fn dropped_cancel_handle_ends_the_pump() {
        let (tx, _rx) = mpsc::channel(4);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let s = stream::pending::<Result<bytes::Bytes, std::io::Error>>();
        let handle = tokio::spawn(pump_events(s, tx, cancel_rx, CancellationToken::new(), DomainFilter::allow_all()));
        drop(cancel_tx);
        let end = tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.unwrap().unwrap();
        assert_eq!(end, PumpEnd::Cancelled);
    }
}
