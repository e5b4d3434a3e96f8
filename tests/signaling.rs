use std::net::SocketAddr;
use std::time::Duration;

use castlink::config::SignalingConfig;
use castlink::signaling::{RoomId, RoomManagerHandle, RoomSnapshot, SignalingServer};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server(config: SignalingConfig) -> (SocketAddr, RoomManagerHandle) {
    let config = SignalingConfig {
        listen_addr: "127.0.0.1:0".parse().unwrap(),
        ..config
    };
    let server = SignalingServer::bind(config).await.expect("bind");
    let addr = server.local_addr().unwrap();
    let handle = server.handle();
    tokio::spawn(server.run());
    (addr, handle)
}

async fn connect(addr: SocketAddr, room: &str) -> Client {
    let (client, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws/{}", addr, room))
        .await
        .expect("connect");
    client
}

async fn send_json(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string().into()))
        .await
        .expect("send");
}

async fn identify(client: &mut Client, role: &str, secret: &str) {
    send_json(
        client,
        json!({"type": "identify", "role": role, "secret": secret}),
    )
    .await;
}

/// Next JSON message, skipping control frames
async fn recv_json(client: &mut Client) -> Value {
    loop {
        let msg = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for message")
            .expect("stream ended")
            .expect("websocket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {:?}", frame),
            _ => continue,
        }
    }
}

/// Read until the server closes, returning its close frame
async fn expect_close(client: &mut Client) -> Option<CloseFrame> {
    loop {
        let next = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for close");
        match next {
            Some(Ok(Message::Close(frame))) => return frame,
            Some(Ok(Message::Text(text))) => panic!("unexpected message: {}", text),
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return None,
        }
    }
}

async fn wait_for_room<F>(handle: &RoomManagerHandle, room: &str, check: F) -> Option<RoomSnapshot>
where
    F: Fn(Option<&RoomSnapshot>) -> bool,
{
    let id = RoomId::parse(room, 64).unwrap();
    for _ in 0..200 {
        let snapshot = handle.room_snapshot(id.clone()).await;
        if check(snapshot.as_ref()) {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room {} never reached the expected state", room);
}

async fn join_host(addr: SocketAddr, handle: &RoomManagerHandle, room: &str, secret: &str) -> Client {
    let mut host = connect(addr, room).await;
    identify(&mut host, "host", secret).await;
    wait_for_room(handle, room, |s| s.is_some_and(|s| s.has_host)).await;
    host
}

/// Identify a viewer in a room that already has a host; returns its assigned id
async fn join_viewer(host: &mut Client, addr: SocketAddr, room: &str, secret: &str) -> (Client, String) {
    let mut viewer = connect(addr, room).await;
    identify(&mut viewer, "viewer", secret).await;

    let ready = recv_json(&mut viewer).await;
    assert_eq!(ready, json!({"type": "ready", "role": "viewer"}));

    let joined = recv_json(host).await;
    assert_eq!(joined["type"], "viewer_joined");
    let viewer_id = joined["viewerId"].as_str().unwrap().to_string();
    (viewer, viewer_id)
}

#[tokio::test]
async fn wrong_secret_is_forbidden_and_room_unchanged() {
    let (addr, handle) = start_server(SignalingConfig::default()).await;
    let _host = join_host(addr, &handle, "abc123", "xyz").await;

    let mut viewer = connect(addr, "abc123").await;
    identify(&mut viewer, "viewer", "wrong").await;
    assert_eq!(
        recv_json(&mut viewer).await,
        json!({"type": "error", "message": "forbidden"})
    );
    let frame = expect_close(&mut viewer).await.expect("close frame");
    assert_eq!(frame.reason.as_str(), "forbidden");

    let snapshot = wait_for_room(&handle, "abc123", |s| s.is_some()).await.unwrap();
    assert!(snapshot.has_host);
    assert!(snapshot.viewers.is_empty());
}

#[tokio::test]
async fn offer_answer_and_candidates_flow_between_host_and_viewer() {
    let (addr, handle) = start_server(SignalingConfig::default()).await;
    let mut host = join_host(addr, &handle, "abc123", "xyz").await;
    let (mut viewer, viewer_id) = join_viewer(&mut host, addr, "abc123", "xyz").await;

    let sdp = json!({"type": "offer", "sdp": "v=0\r\no=- 1 1 IN IP4 0.0.0.0\r\n"});
    send_json(&mut viewer, json!({"type": "offer", "sdp": sdp})).await;
    let offer = recv_json(&mut host).await;
    assert_eq!(offer["type"], "offer");
    assert_eq!(offer["viewerId"], viewer_id.as_str());
    assert_eq!(offer["sdp"], sdp);

    send_json(
        &mut viewer,
        json!({"type": "ice-candidate", "candidate": {"candidate": "c-viewer"}, "target": "host"}),
    )
    .await;
    let candidate = recv_json(&mut host).await;
    assert_eq!(candidate["from"], viewer_id.as_str());
    assert_eq!(candidate["candidate"]["candidate"], "c-viewer");

    send_json(
        &mut host,
        json!({"type": "answer", "viewerId": viewer_id, "sdp": {"type": "answer", "sdp": "v=0"}}),
    )
    .await;
    let answer = recv_json(&mut viewer).await;
    assert_eq!(answer["type"], "answer");
    assert_eq!(answer["sdp"]["sdp"], "v=0");

    send_json(
        &mut host,
        json!({"type": "ice-candidate", "candidate": {"candidate": "c-host"}, "target": viewer_id}),
    )
    .await;
    let candidate = recv_json(&mut viewer).await;
    assert_eq!(candidate["candidate"]["candidate"], "c-host");
}

#[tokio::test]
async fn viewer_waits_for_host_before_ready() {
    let (addr, handle) = start_server(SignalingConfig::default()).await;

    let mut viewer = connect(addr, "lobby").await;
    identify(&mut viewer, "viewer", "").await;
    wait_for_room(&handle, "lobby", |s| s.is_some_and(|s| s.viewers.len() == 1)).await;

    let mut host = connect(addr, "lobby").await;
    identify(&mut host, "host", "").await;

    assert_eq!(recv_json(&mut viewer).await["type"], "ready");
    assert_eq!(recv_json(&mut host).await["type"], "viewer_joined");
}

#[tokio::test]
async fn malformed_and_unknown_messages_are_ignored() {
    let (addr, handle) = start_server(SignalingConfig::default()).await;
    let mut host = join_host(addr, &handle, "noise", "").await;
    let (mut viewer, viewer_id) = join_viewer(&mut host, addr, "noise", "").await;

    viewer
        .send(Message::Text("definitely not json".into()))
        .await
        .unwrap();
    send_json(&mut viewer, json!({"type": "chat", "text": "hello"})).await;
    send_json(&mut viewer, json!({"type": "offer", "sdp": {}})).await;

    let offer = recv_json(&mut host).await;
    assert_eq!(offer["type"], "offer");
    assert_eq!(offer["viewerId"], viewer_id.as_str());
}

#[tokio::test]
async fn host_disconnect_notifies_each_viewer() {
    let (addr, handle) = start_server(SignalingConfig::default()).await;
    let mut host = join_host(addr, &handle, "fanout", "").await;

    let mut viewers = Vec::new();
    for _ in 0..3 {
        let (viewer, _) = join_viewer(&mut host, addr, "fanout", "").await;
        viewers.push(viewer);
    }

    host.close(None).await.unwrap();

    for viewer in viewers.iter_mut() {
        assert_eq!(
            recv_json(viewer).await,
            json!({"type": "host_disconnected"})
        );
    }
    let snapshot = wait_for_room(&handle, "fanout", |s| s.is_some_and(|s| !s.has_host))
        .await
        .unwrap();
    assert_eq!(snapshot.viewers.len(), 3);
}

#[tokio::test]
async fn viewer_disconnect_notifies_host_and_empty_room_is_removed() {
    let (addr, handle) = start_server(SignalingConfig::default()).await;
    let mut host = join_host(addr, &handle, "bye", "").await;
    let (mut viewer, viewer_id) = join_viewer(&mut host, addr, "bye", "").await;

    viewer.close(None).await.unwrap();
    assert_eq!(
        recv_json(&mut host).await,
        json!({"type": "viewer_left", "viewerId": viewer_id})
    );

    host.close(None).await.unwrap();
    wait_for_room(&handle, "bye", |s| s.is_none()).await;
    assert_eq!(handle.room_count().await, 0);
}

#[tokio::test]
async fn new_host_replaces_previous_host() {
    let (addr, handle) = start_server(SignalingConfig::default()).await;
    let mut first = join_host(addr, &handle, "takeover", "").await;
    let (mut viewer, viewer_id) = join_viewer(&mut first, addr, "takeover", "").await;

    let mut second = connect(addr, "takeover").await;
    identify(&mut second, "host", "").await;

    assert_eq!(
        recv_json(&mut first).await,
        json!({"type": "host_disconnected"})
    );
    let frame = expect_close(&mut first).await.expect("close frame");
    assert_eq!(frame.reason.as_str(), "replaced");

    assert_eq!(recv_json(&mut viewer).await["type"], "host_disconnected");
    assert_eq!(recv_json(&mut viewer).await["type"], "ready");
    assert_eq!(
        recv_json(&mut second).await,
        json!({"type": "viewer_joined", "viewerId": viewer_id})
    );

    send_json(&mut viewer, json!({"type": "offer", "sdp": {}})).await;
    assert_eq!(recv_json(&mut second).await["type"], "offer");
}

#[tokio::test]
async fn unidentified_connection_times_out() {
    let config = SignalingConfig {
        identify_timeout: Duration::from_millis(200),
        ..SignalingConfig::default()
    };
    let (addr, _handle) = start_server(config).await;

    let mut client = connect(addr, "idle").await;
    // relay traffic before identify is ignored
    send_json(&mut client, json!({"type": "offer", "sdp": {}})).await;

    assert_eq!(
        recv_json(&mut client).await,
        json!({"type": "error", "message": "identify_timeout"})
    );
    let frame = expect_close(&mut client).await.expect("close frame");
    assert_eq!(frame.reason.as_str(), "identify_timeout");
}

#[tokio::test]
async fn silent_connection_is_dropped_after_pong_timeout() {
    let config = SignalingConfig {
        ping_interval: Duration::from_millis(300),
        pong_timeout: Duration::from_millis(300),
        ..SignalingConfig::default()
    };
    let (addr, handle) = start_server(config).await;

    // never polled again, so the client library never answers pings
    let _host = join_host(addr, &handle, "quiet", "").await;

    wait_for_room(&handle, "quiet", |s| s.is_none()).await;
    assert_eq!(handle.room_count().await, 0);
}

#[tokio::test]
async fn oversized_frame_closes_connection_and_frees_viewer() {
    let config = SignalingConfig {
        max_message_size: 1024,
        ..SignalingConfig::default()
    };
    let (addr, handle) = start_server(config).await;
    let mut host = join_host(addr, &handle, "bulky", "").await;
    let (mut viewer, viewer_id) = join_viewer(&mut host, addr, "bulky", "").await;

    let sdp = "a".repeat(4096);
    // the server may already have dropped the socket by the time this flushes
    let _ = viewer
        .send(Message::Text(
            json!({"type": "offer", "sdp": sdp}).to_string().into(),
        ))
        .await;

    assert_eq!(
        recv_json(&mut host).await,
        json!({"type": "viewer_left", "viewerId": viewer_id})
    );
    let snapshot = wait_for_room(&handle, "bulky", |s| s.is_some_and(|s| s.viewers.is_empty()))
        .await
        .unwrap();
    assert!(snapshot.has_host);
}

#[tokio::test]
async fn handshake_rejects_unknown_paths() {
    let (addr, _handle) = start_server(SignalingConfig::default()).await;

    let err = tokio_tungstenite::connect_async(format!("ws://{}/rooms/abc", addr))
        .await
        .expect_err("path outside /ws/ must be refused");
    match err {
        WsError::Http(response) => assert_eq!(response.status().as_u16(), 404),
        other => panic!("expected HTTP refusal, got {:?}", other),
    }

    let long = "x".repeat(100);
    let err = tokio_tungstenite::connect_async(format!("ws://{}/ws/{}", addr, long))
        .await
        .expect_err("overlong room id must be refused");
    match err {
        WsError::Http(response) => assert_eq!(response.status().as_u16(), 400),
        other => panic!("expected HTTP refusal, got {:?}", other),
    }
}
