use crisis_domain::{Action, AppState, MetaPatch, SessionId, Severity};
use crisis_server::ServerConfig;
use crisis_sync::{
    HttpRemote, OfflineQueue, RemoteError, RemoteOutcome, RemoteStore, SyncConfig, SyncEngine,
    SyncHandle, SyncSnapshot,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn start_server() -> crisis_server::StartedServer {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    crisis_server::start_server_with_config(addr, ServerConfig::ephemeral())
        .await
        .unwrap()
}

async fn wait_until(handle: &SyncHandle, what: impl Fn(&SyncSnapshot) -> bool) -> SyncSnapshot {
    let mut rx = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| what(s)))
        .await
        .expect("timed out waiting for synchronizer")
        .expect("synchronizer stopped")
        .clone()
}

#[tokio::test]
async fn http_remote_speaks_the_server_api() {
    let server = start_server().await;
    let remote = HttpRemote::new(format!("http://{}/", server.addr)).unwrap();
    let id = SessionId::parse("s-http").unwrap();

    assert_eq!(remote.fetch(&id).await.unwrap(), None);

    let mut state = AppState::default_session("2024-01-01T00:00:00Z");
    state.meta.severity = Severity::High;
    let ack = remote.save(&id, &state, Some("op-1")).await.unwrap();
    assert_eq!(ack.version, 1);
    let replay = remote.save(&id, &state, Some("op-1")).await.unwrap();
    assert_eq!(replay, ack);

    let stored = remote.fetch(&id).await.unwrap().unwrap();
    assert_eq!(stored.meta.severity, Severity::High);
    assert_eq!(stored.meta.version, 1);

    let next = remote.reset(&id).await.unwrap();
    assert_ne!(next, id);
    assert_eq!(remote.fetch(&id).await.unwrap(), None);

    remote.save(&next, &state, None).await.unwrap();
    remote.delete(&next).await.unwrap();
    assert_eq!(remote.fetch(&next).await.unwrap(), None);
}

#[tokio::test]
async fn unreachable_server_is_retryable() {
    let server = start_server().await;
    let addr = server.addr;
    drop(server);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let remote = HttpRemote::new(format!("http://{addr}")).unwrap();
    let err = remote
        .fetch(&SessionId::parse("s-gone").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, RemoteError::Unreachable(_)), "unexpected: {err}");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn malformed_success_body_is_not_retryable() {
    let dir = tempfile::tempdir().unwrap();
    let api = dir.path().join("mirror/api");
    std::fs::create_dir_all(&api).unwrap();
    std::fs::write(api.join("state"), "<html>maintenance</html>").unwrap();

    let config = ServerConfig {
        web_dist_dir: dir.path().to_path_buf(),
        ..ServerConfig::ephemeral()
    };
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    let server = crisis_server::start_server_with_config(addr, config)
        .await
        .unwrap();

    let remote = HttpRemote::new(format!("http://{}/mirror", server.addr)).unwrap();
    let err = remote
        .fetch(&SessionId::parse("s-mirror").unwrap())
        .await
        .unwrap_err();
    assert!(
        matches!(err, RemoteError::Rejected { status: 200, .. }),
        "unexpected: {err}"
    );
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn two_clients_converge_through_the_server() {
    let server = start_server().await;
    let base = format!("http://{}", server.addr);
    let config = SyncConfig {
        poll_interval: Duration::from_millis(50),
        ..SyncConfig::new(SessionId::parse("s-shared").unwrap())
    };

    let alice = SyncEngine::start(
        config.clone(),
        Arc::new(HttpRemote::new(base.clone()).unwrap()),
        Arc::new(OfflineQueue::in_memory()),
    )
    .await;
    let bob = SyncEngine::start(
        config,
        Arc::new(HttpRemote::new(base).unwrap()),
        Arc::new(OfflineQueue::in_memory()),
    )
    .await;

    alice
        .dispatch(Action::UpdateMeta(MetaPatch {
            title: Some("Warehouse fire".to_owned()),
            ..Default::default()
        }))
        .await
        .unwrap();
    wait_until(&alice, |s| !s.unconfirmed && !s.in_flight).await;

    let seen = wait_until(&bob, |s| s.state.meta.title == "Warehouse fire").await;
    assert_eq!(seen.state.meta.version, 1);
    assert_eq!(bob.poll_now().await.unwrap(), RemoteOutcome::Unchanged);

    alice.shutdown().await;
    bob.shutdown().await;
}
