use crisis_api::{PROTOCOL_VERSION, WsClientMessage, WsServerMessage};
use crisis_domain::{AppState, CrisisMode, Severity};
use crisis_server::ServerConfig;
use futures::{SinkExt as _, StreamExt as _};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn recv_ws_msg(socket: &mut Socket) -> WsServerMessage {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("timed out waiting for ws message")
            .expect("websocket stream ended")
            .expect("websocket recv failed");
        if let Message::Text(text) = next {
            return serde_json::from_str(&text).expect("failed to parse ws server message");
        }
    }
}

async fn send_ws_msg(socket: &mut Socket, msg: &WsClientMessage) {
    socket
        .send(Message::Text(serde_json::to_string(msg).unwrap().into()))
        .await
        .unwrap();
}

/// Connects and consumes the hello snapshot.
async fn connect(addr: SocketAddr, session: &str) -> (Socket, AppState) {
    let url = format!("ws://{addr}/api/events?sessionId={session}");
    let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    match recv_ws_msg(&mut socket).await {
        WsServerMessage::Hello {
            protocol_version,
            state,
            ..
        } => {
            assert_eq!(protocol_version, PROTOCOL_VERSION);
            (socket, *state)
        }
        other => panic!("expected hello, got {other:?}"),
    }
}

/// Ping and wait for the pong; anything queued before it is returned.
async fn drain_until_pong(socket: &mut Socket) -> Vec<WsServerMessage> {
    send_ws_msg(socket, &WsClientMessage::Ping).await;
    let mut seen = Vec::new();
    loop {
        match recv_ws_msg(socket).await {
            WsServerMessage::Pong => return seen,
            other => seen.push(other),
        }
    }
}

async fn start() -> crisis_server::StartedServer {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    crisis_server::start_server_with_config(addr, ServerConfig::ephemeral())
        .await
        .unwrap()
}

#[tokio::test]
async fn submit_is_broadcast_to_other_clients_of_the_session_only() {
    let server = start().await;
    let (mut author, mut state) = connect(server.addr, "s-room").await;
    let (mut peer, _) = connect(server.addr, "s-room").await;
    let (mut stranger, _) = connect(server.addr, "s-elsewhere").await;

    state.meta.severity = Severity::Critical;
    send_ws_msg(
        &mut author,
        &WsClientMessage::Submit {
            request_id: "r1".to_owned(),
            state: serde_json::to_value(&state).unwrap(),
            base_version: None,
            client_op_id: None,
        },
    )
    .await;

    match recv_ws_msg(&mut author).await {
        WsServerMessage::Ack {
            request_id,
            version,
            ..
        } => {
            assert_eq!(request_id, "r1");
            assert_eq!(version, 1);
        }
        other => panic!("expected ack, got {other:?}"),
    }

    match recv_ws_msg(&mut peer).await {
        WsServerMessage::StateChanged { session_id, state } => {
            assert_eq!(session_id.as_str(), "s-room");
            assert_eq!(state.meta.severity, Severity::Critical);
            assert_eq!(state.meta.version, 1);
        }
        other => panic!("expected stateChanged, got {other:?}"),
    }

    assert!(drain_until_pong(&mut author).await.is_empty());
    assert!(drain_until_pong(&mut stranger).await.is_empty());
}

#[tokio::test]
async fn http_saves_reach_realtime_clients() {
    let server = start().await;
    let (mut listener, mut state) = connect(server.addr, "s-mixed").await;

    state.meta.mode = CrisisMode::Real;
    let res = reqwest::Client::new()
        .post(format!("http://{}/api/state", server.addr))
        .json(&serde_json::json!({ "sessionId": "s-mixed", "state": state }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::OK);

    match recv_ws_msg(&mut listener).await {
        WsServerMessage::StateChanged { state, .. } => {
            assert_eq!(state.meta.mode, CrisisMode::Real);
        }
        other => panic!("expected stateChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn reset_clears_in_place_and_broadcasts() {
    let server = start().await;
    let (mut author, mut state) = connect(server.addr, "s-wipe").await;
    let (mut peer, _) = connect(server.addr, "s-wipe").await;

    state.meta.title = "Cyber attack".to_owned();
    send_ws_msg(
        &mut author,
        &WsClientMessage::Submit {
            request_id: "r1".to_owned(),
            state: serde_json::to_value(&state).unwrap(),
            base_version: None,
            client_op_id: None,
        },
    )
    .await;
    assert!(matches!(
        recv_ws_msg(&mut author).await,
        WsServerMessage::Ack { .. }
    ));
    assert!(matches!(
        recv_ws_msg(&mut peer).await,
        WsServerMessage::StateChanged { .. }
    ));

    send_ws_msg(
        &mut author,
        &WsClientMessage::Reset {
            request_id: "r2".to_owned(),
        },
    )
    .await;
    assert!(matches!(
        recv_ws_msg(&mut author).await,
        WsServerMessage::Ack { request_id, .. } if request_id == "r2"
    ));
    match recv_ws_msg(&mut peer).await {
        WsServerMessage::StateChanged { state, .. } => {
            assert_eq!(state.meta.title, AppState::DEFAULT_TITLE);
            assert!(state.phases.iter().all(|p| p.strategic.is_empty()));
        }
        other => panic!("expected stateChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn invalid_import_is_rejected_without_broadcast() {
    let server = start().await;
    let (mut author, _) = connect(server.addr, "s-import").await;
    let (mut peer, _) = connect(server.addr, "s-import").await;

    send_ws_msg(
        &mut author,
        &WsClientMessage::Import {
            request_id: "r1".to_owned(),
            document: serde_json::json!({ "meta": { "title": "half a file" } }),
        },
    )
    .await;
    match recv_ws_msg(&mut author).await {
        WsServerMessage::Error {
            request_id,
            message,
        } => {
            assert_eq!(request_id.as_deref(), Some("r1"));
            assert!(message.contains("phases"), "unexpected: {message}");
        }
        other => panic!("expected error, got {other:?}"),
    }
    assert!(drain_until_pong(&mut peer).await.is_empty());

    let mut exported = AppState::default_session("2024-05-05T05:05:05Z");
    exported.meta.title = "Imported drill".to_owned();
    send_ws_msg(
        &mut author,
        &WsClientMessage::Import {
            request_id: "r2".to_owned(),
            document: serde_json::to_value(&exported).unwrap(),
        },
    )
    .await;
    assert!(matches!(
        recv_ws_msg(&mut author).await,
        WsServerMessage::Ack { .. }
    ));
    match recv_ws_msg(&mut peer).await {
        WsServerMessage::StateChanged { state, .. } => {
            assert_eq!(state.meta.title, "Imported drill");
        }
        other => panic!("expected stateChanged, got {other:?}"),
    }
}

#[tokio::test]
async fn hello_resyncs_current_state() {
    let server = start().await;
    let (mut socket, _) = connect(server.addr, "s-hello").await;

    send_ws_msg(
        &mut socket,
        &WsClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            last_seen_version: None,
        },
    )
    .await;
    assert!(matches!(
        recv_ws_msg(&mut socket).await,
        WsServerMessage::StateChanged { .. }
    ));

    send_ws_msg(
        &mut socket,
        &WsClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION + 1,
            last_seen_version: None,
        },
    )
    .await;
    assert!(matches!(
        recv_ws_msg(&mut socket).await,
        WsServerMessage::Error { request_id: None, .. }
    ));
}

#[tokio::test]
async fn hello_with_current_version_skips_the_snapshot() {
    let server = start().await;
    let (mut socket, state) = connect(server.addr, "s-known").await;

    send_ws_msg(
        &mut socket,
        &WsClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            last_seen_version: Some(state.meta.version),
        },
    )
    .await;
    assert!(drain_until_pong(&mut socket).await.is_empty());

    send_ws_msg(
        &mut socket,
        &WsClientMessage::Hello {
            protocol_version: PROTOCOL_VERSION,
            last_seen_version: Some(state.meta.version + 7),
        },
    )
    .await;
    let seen = drain_until_pong(&mut socket).await;
    assert_eq!(seen.len(), 1);
    assert!(matches!(seen[0], WsServerMessage::StateChanged { .. }));
}
