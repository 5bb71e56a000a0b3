//! Integration tests for the authenticated transport: handshake, timeout,
//! credential-rotation on auth failure, and reconnection, against an
//! in-process WebSocket server.

use std::sync::Arc;
use std::time::Duration;

use praxis_collab::testkit::{CollabTestServer, ScriptedCredentials};
use praxis_collab::{
    CollabConfig, CollabError, ConnectionState, TokenManager, Transport, TransportEvent,
};
use tokio::sync::broadcast;
use tokio::time::timeout;

fn transport_for(server: &CollabTestServer) -> (Transport, Arc<ScriptedCredentials>) {
    let config = CollabConfig {
        server_url: server.url(),
        connect_timeout: Duration::from_millis(300),
        reconnection_delay: Duration::from_millis(50),
        ..CollabConfig::default()
    };
    transport_with(server, config)
}

fn transport_with(
    server: &CollabTestServer,
    mut config: CollabConfig,
) -> (Transport, Arc<ScriptedCredentials>) {
    config.server_url = server.url();
    let source = Arc::new(ScriptedCredentials::new());
    let tokens = Arc::new(TokenManager::with_source(&config, source.clone()));
    (Transport::new(config, tokens), source)
}

async fn next_matching(
    rx: &mut broadcast::Receiver<TransportEvent>,
    pred: impl Fn(&TransportEvent) -> bool,
) -> TransportEvent {
    timeout(Duration::from_secs(3), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("expected transport event")
}

#[tokio::test]
async fn test_handshake_carries_credential() {
    let server = CollabTestServer::spawn().await;
    let (transport, source) = transport_for(&server);

    transport.connect().await.unwrap();

    assert_eq!(transport.state().await, ConnectionState::Connected);
    assert_eq!(source.fetch_count(), 1);
    assert_eq!(server.hellos(), vec!["csrf-1".to_string()]);
    // The upgrade request carried the credential session cookie.
    assert!(server.cookies()[0].contains("praxis_session=sess-1"));
    let cred = transport.current_credential().await.unwrap();
    assert_eq!(cred.csrf_token, "csrf-1");
}

#[tokio::test]
async fn test_connect_is_noop_when_connected() {
    let server = CollabTestServer::spawn().await;
    let (transport, source) = transport_for(&server);

    transport.connect().await.unwrap();
    transport.connect().await.unwrap();

    assert_eq!(server.hellos().len(), 1);
    assert_eq!(source.fetch_count(), 1);
}

#[tokio::test]
async fn test_connect_times_out_without_acknowledgement() {
    let server = CollabTestServer::spawn().await;
    server.stall_handshake(true);
    let (transport, _source) = transport_for(&server);

    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, CollabError::ConnectionTimeout));
    assert_eq!(transport.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_auth_rejection_refreshes_token_once() {
    let server = CollabTestServer::spawn().await;
    server.reject_next(1, "csrf token expired");
    let (transport, source) = transport_for(&server);

    transport.connect().await.unwrap();

    // One forced refresh, and the retry carried the fresh token.
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(
        server.hellos(),
        vec!["csrf-1".to_string(), "csrf-2".to_string()]
    );
    assert_eq!(transport.state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_auth_rejection_not_retried_twice() {
    let server = CollabTestServer::spawn().await;
    server.reject_next(2, "invalid credential");
    let (transport, source) = transport_for(&server);

    let err = transport.connect().await.unwrap_err();
    assert!(matches!(err, CollabError::Auth(_)));
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(server.hellos().len(), 2);
    assert_eq!(transport.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_non_auth_rejection_surfaces_unmodified() {
    let server = CollabTestServer::spawn().await;
    server.reject_next(1, "room is full");
    let (transport, source) = transport_for(&server);

    let err = transport.connect().await.unwrap_err();
    match err {
        CollabError::Auth(reason) => assert_eq!(reason, "room is full"),
        other => panic!("unexpected error: {other}"),
    }
    // No credential refresh for a non-credential rejection.
    assert_eq!(source.fetch_count(), 1);
    assert_eq!(server.hellos().len(), 1);
}

#[tokio::test]
async fn test_reconnect_installs_fresh_credential_before_notifying() {
    let server = CollabTestServer::spawn().await;
    let (transport, source) = transport_for(&server);

    transport.connect().await.unwrap();
    let mut events = transport.subscribe();

    server.kill_connections();

    next_matching(&mut events, |e| matches!(e, TransportEvent::Reconnected)).await;

    // By the time listeners hear Reconnected, the server has already seen
    // the forced-fresh token on the new handshake.
    assert_eq!(source.fetch_count(), 2);
    assert_eq!(
        server.hellos(),
        vec!["csrf-1".to_string(), "csrf-2".to_string()]
    );
    assert_eq!(
        transport.current_credential().await.unwrap().csrf_token,
        "csrf-2"
    );
    assert_eq!(transport.state().await, ConnectionState::Connected);
}

#[tokio::test]
async fn test_reconnect_attempts_exhausted() {
    let server = CollabTestServer::spawn().await;
    let config = CollabConfig {
        connect_timeout: Duration::from_millis(100),
        reconnection_attempts: 2,
        reconnection_delay: Duration::from_millis(30),
        ..CollabConfig::default()
    };
    let (transport, _source) = transport_with(&server, config);

    transport.connect().await.unwrap();
    let mut events = transport.subscribe();

    // Every reconnect handshake will hang until the per-attempt timeout.
    server.stall_handshake(true);
    server.kill_connections();

    next_matching(&mut events, |e| matches!(e, TransportEvent::Disconnected)).await;
    assert_eq!(transport.state().await, ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_no_reconnect_after_explicit_disconnect() {
    let server = CollabTestServer::spawn().await;
    let (transport, _source) = transport_for(&server);

    transport.connect().await.unwrap();
    transport.disconnect().await;

    assert_eq!(transport.state().await, ConnectionState::Disconnected);
    assert!(transport.current_credential().await.is_none());

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.hellos().len(), 1);
}

#[tokio::test]
async fn test_send_fails_during_disconnect_window() {
    let server = CollabTestServer::spawn().await;
    let (transport, _source) = transport_for(&server);

    let err = transport.send("operation", vec![1]).await.unwrap_err();
    assert!(matches!(err, CollabError::NotConnected));

    transport.connect().await.unwrap();
    transport.send("operation", vec![1]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.event_names(), vec!["operation".to_string()]);

    transport.disconnect().await;
    let err = transport.send("operation", vec![2]).await.unwrap_err();
    assert!(matches!(err, CollabError::NotConnected));
}

#[tokio::test]
async fn test_inbound_event_frames_are_delivered() {
    let server = CollabTestServer::spawn().await;
    let (transport, _source) = transport_for(&server);

    transport.connect().await.unwrap();
    let mut events = transport.subscribe();

    transport.send("operation", vec![7, 8, 9]).await.unwrap();

    let event = next_matching(&mut events, |e| matches!(e, TransportEvent::Event { .. })).await;
    match event {
        TransportEvent::Event { name, data } => {
            assert_eq!(name, "operation");
            assert_eq!(data, vec![7, 8, 9]);
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_reconnection_disabled_goes_straight_to_disconnected() {
    let server = CollabTestServer::spawn().await;
    let config = CollabConfig {
        reconnection: false,
        connect_timeout: Duration::from_millis(300),
        ..CollabConfig::default()
    };
    let (transport, source) = transport_with(&server, config);

    transport.connect().await.unwrap();
    let mut events = transport.subscribe();

    server.kill_connections();
    next_matching(&mut events, |e| matches!(e, TransportEvent::Disconnected)).await;

    assert_eq!(transport.state().await, ConnectionState::Disconnected);
    assert_eq!(source.fetch_count(), 1);
}
