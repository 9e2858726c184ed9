//! Reconnection behaviour of `ConnectionManager` over the loopback transport.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use voxlink_transport::{ConnectTarget, ConnectionManager, ConnectionSettings, LoopbackTransport};
use voxlink_types::ConnectionState;

fn target() -> ConnectTarget {
    ConnectTarget {
        server_url: "loopback://rtc".to_string(),
        room_name: "room".to_string(),
        token: "token".to_string(),
    }
}

fn settings() -> ConnectionSettings {
    ConnectionSettings {
        jitter_ms: 0,
        ..ConnectionSettings::default()
    }
}

fn drain(rx: &mut broadcast::Receiver<ConnectionState>) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    while let Ok(state) = rx.try_recv() {
        seen.push(state);
    }
    seen
}

async fn connected_manager() -> (ConnectionManager, LoopbackTransport) {
    let (local, _remote) = LoopbackTransport::pair();
    let manager = ConnectionManager::new(Arc::new(local.clone()), settings());
    manager.connect(target()).await.expect("connect should succeed");
    (manager, local)
}

#[tokio::test(start_paused = true)]
async fn resumes_when_transport_recovers() {
    let (manager, link) = connected_manager().await;
    let mut states = manager.subscribe_state();

    link.drop_link();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(manager.state(), ConnectionState::Reconnecting);

    link.resume_link();
    tokio::time::sleep(Duration::from_millis(10)).await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(
        drain(&mut states),
        vec![ConnectionState::Reconnecting, ConnectionState::Connected]
    );
}

#[tokio::test(start_paused = true)]
async fn reconnects_by_itself_once_link_heals() {
    let (manager, link) = connected_manager().await;

    link.drop_link();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(manager.state(), ConnectionState::Reconnecting);

    link.heal_link_silently();
    // Attempts fire at 0.5s, 1.5s, 3.5s after the loss.
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(link.connect_calls(), 4);
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_reconnect_budget() {
    let (manager, link) = connected_manager().await;
    let mut states = manager.subscribe_state();
    let lost_at = tokio::time::Instant::now();

    link.drop_link();
    tokio::time::sleep(Duration::from_secs(23)).await;
    assert_eq!(manager.state(), ConnectionState::Reconnecting);

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(lost_at.elapsed() <= Duration::from_secs(33));

    // 0.5 + 1 + 2 + 4 + 8 + 8 = 23.5s of backoff; one more 8s step would
    // exceed the 30s budget.
    assert_eq!(link.connect_calls(), 1 + 6);
    assert_eq!(
        drain(&mut states),
        vec![ConnectionState::Reconnecting, ConnectionState::Disconnected]
    );
    assert!(!link.is_connected());
}

#[tokio::test(start_paused = true)]
async fn rejected_token_ends_reconnection_early() {
    let (manager, link) = connected_manager().await;

    link.drop_link();
    link.set_reject_auth(true);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(link.connect_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn explicit_disconnect_stops_reconnection() {
    let (manager, link) = connected_manager().await;

    link.drop_link();
    tokio::time::sleep(Duration::from_millis(100)).await;
    manager.disconnect().await;
    link.heal_link_silently();
    tokio::time::sleep(Duration::from_secs(40)).await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(link.connect_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn can_connect_again_after_giving_up() {
    let (manager, link) = connected_manager().await;

    link.drop_link();
    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    link.heal_link_silently();
    manager.connect(target()).await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.send_raw(b"{}").await.is_ok());
}
