#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use floorplan_core::{DomainFilter, TriState};
use floorplan_hass::{HassClient, HassError};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const TOKEN: &str = "secret-token";

fn changed(id: &str, state: &str) -> String {
    let ev = json!({
        "event_type": "state_changed",
        "data": { "new_state": { "entity_id": id, "state": state } }
    });
    format!("data: {}\n\n", ev)
}

async fn client_for(server: &MockServer) -> HassClient {
    HassClient::new(&server.uri(), TOKEN).expect("client")
}

#[tokio::test]
async fn snapshot_normalizes_rows_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/states"))
        .and(header("authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "entity_id": "light.kitchen", "state": "on", "attributes": {} },
            { "entity_id": "cover.garage", "state": "closed" },
            { "entity_id": "sensor.temp", "state": "21.5" },
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let states = client_for(&server).await.snapshot().await.expect("snapshot");
    let got: Vec<(&str, TriState)> = states.iter().map(|s| (s.id(), s.value())).collect();
    assert_eq!(
        got,
        vec![("light.kitchen", TriState::On), ("cover.garage", TriState::Off), ("sensor.temp", TriState::Unknown)]
    );
    server.verify().await;
}

#[tokio::test]
async fn snapshot_honours_domain_filter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/states"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "entity_id": "light.kitchen", "state": "on" },
            { "entity_id": "sensor.temp", "state": "21.5" },
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server).await.with_domain_filter(DomainFilter::new(["light"]));
    let states = client.snapshot().await.expect("snapshot");
    assert_eq!(states.len(), 1);
    assert_eq!(states[0].id(), "light.kitchen");
}

#[tokio::test]
async fn snapshot_status_errors() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/states"))
        .respond_with(ResponseTemplate::new(401).set_body_string("401: Unauthorized"))
        .mount(&server)
        .await;
    let err = client_for(&server).await.snapshot().await.unwrap_err();
    assert!(matches!(err, HassError::Auth { .. }), "got {err:?}");

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/states"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let err = client_for(&server).await.snapshot().await.unwrap_err();
    assert!(matches!(err, HassError::Protocol { .. }), "got {err:?}");
}

/// Keep-alive HTTP/1.1 server answering every request with `status` and `body`.
/// Returns its base url and the number of connections accepted so far.
async fn counting_server(status: &'static str, body: String) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let count = accepted.clone();
    let body: Arc<str> = body.into();
    tokio::spawn(async move {
        while let Ok((sock, _)) = listener.accept().await {
            count.fetch_add(1, Ordering::SeqCst);
            let body = body.clone();
            tokio::spawn(async move {
                let (rd, mut wr) = sock.into_split();
                let mut rd = BufReader::new(rd);
                let mut line = String::new();
                loop {
                    loop {
                        line.clear();
                        match rd.read_line(&mut line).await {
                            Ok(0) | Err(_) => return,
                            Ok(_) if line == "\r\n" => break,
                            Ok(_) => {}
                        }
                    }
                    let head = format!(
                        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
                        status,
                        body.len()
                    );
                    if wr.write_all(head.as_bytes()).await.is_err() || wr.write_all(body.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (format!("http://{}", addr), accepted)
}

#[tokio::test]
async fn snapshot_error_bodies_are_drained_for_reuse() {
    // Large enough that it cannot arrive with the response head.
    let body = json!({ "message": "x".repeat(256 * 1024) }).to_string();
    for status in ["500 Internal Server Error", "401 Unauthorized"] {
        let (url, accepted) = counting_server(status, body.clone()).await;
        let client = HassClient::new(&url, TOKEN).unwrap();
        for _ in 0..3 {
            let err = client.snapshot().await.unwrap_err();
            assert!(matches!(err, HassError::Protocol { .. } | HassError::Auth { .. }), "got {err:?}");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(accepted.load(Ordering::SeqCst), 1, "{}: connection was not reused", status);
    }
}

#[tokio::test]
async fn snapshot_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/states"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "not": "a list" })))
        .mount(&server)
        .await;
    let err = client_for(&server).await.snapshot().await.unwrap_err();
    assert!(matches!(err, HassError::Decode(_)), "got {err:?}");
}

#[tokio::test]
async fn snapshot_transport_error() {
    // Nothing listens on the discard port of localhost in CI containers.
    let client = HassClient::new("http://127.0.0.1:9", TOKEN).unwrap();
    let err = client.snapshot().await.unwrap_err();
    assert!(matches!(err, HassError::Transport(_)), "got {err:?}");
}

#[tokio::test]
async fn stream_yields_state_changes_until_close() {
    let server = MockServer::start().await;
    let body = format!(
        "data: ping\n\n{}data: {}\n\n{}",
        changed("light.kitchen", "off"),
        json!({ "event_type": "call_service", "data": {} }),
        changed("switch.fan", "on"),
    );
    Mock::given(method("GET"))
        .and(path("/api/stream"))
        .and(header("authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let mut handle = client_for(&server).await.stream(&CancellationToken::new()).await.expect("stream");
    let mut got = Vec::new();
    while let Some(s) = tokio::time::timeout(Duration::from_secs(2), handle.rx.recv()).await.expect("stream stalled") {
        got.push((s.id().to_string(), s.value()));
    }
    assert_eq!(
        got,
        vec![("light.kitchen".to_string(), TriState::Off), ("switch.fan".to_string(), TriState::On)]
    );
}

#[tokio::test]
async fn stream_ends_on_malformed_frame() {
    let server = MockServer::start().await;
    let body = format!("{}data: {{oops\n\n{}", changed("light.a", "on"), changed("light.b", "on"));
    Mock::given(method("GET"))
        .and(path("/api/stream"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let mut handle = client_for(&server).await.stream(&CancellationToken::new()).await.expect("stream");
    let first = handle.rx.recv().await.expect("first record");
    assert_eq!(first.id(), "light.a");
    let end = tokio::time::timeout(Duration::from_secs(2), handle.rx.recv()).await.expect("stream stalled");
    assert!(end.is_none());
}

#[tokio::test]
async fn stream_rejected_status_fails_immediately() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/stream"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&server)
        .await;
    let res = client_for(&server).await.stream(&CancellationToken::new()).await;
    assert!(matches!(res, Err(HassError::Auth { .. })));
}

#[tokio::test]
async fn check_api_returns_message() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "message": "API running." })))
        .mount(&server)
        .await;
    let msg = client_for(&server).await.check_api().await.expect("check");
    assert_eq!(msg, "API running.");
}
