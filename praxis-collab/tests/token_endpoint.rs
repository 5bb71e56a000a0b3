//! Integration tests for the HTTP credential source against a canned
//! in-process endpoint.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use praxis_collab::{CollabConfig, CollabError, CredentialSource, HttpCredentialSource, TokenManager};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serve a fixed HTTP response for every request, counting requests.
async fn spawn_endpoint(status_line: &str, body: String) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let requests = Arc::new(AtomicUsize::new(0));

    let counter = requests.clone();
    let status_line = status_line.to_string();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let status_line = status_line.clone();
            let body = body.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf).await;
                let response = format!(
                    "{status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    (addr, requests)
}

#[tokio::test]
async fn test_fetch_parses_camel_case_response() {
    let body = serde_json::json!({
        "csrfToken": "abc",
        "sessionId": "s1",
    })
    .to_string();
    let (addr, _requests) = spawn_endpoint("HTTP/1.1 200 OK", body).await;

    let source = HttpCredentialSource::new(&format!("http://{addr}"));
    let claims = source.fetch().await.unwrap();

    assert_eq!(claims.csrf_token, "abc");
    assert_eq!(claims.session_id, "s1");
}

#[tokio::test]
async fn test_error_status_is_a_token_fetch_error() {
    let (addr, _requests) = spawn_endpoint("HTTP/1.1 503 Service Unavailable", String::new()).await;

    let source = HttpCredentialSource::new(&format!("http://{addr}"));
    let err = source.fetch().await.unwrap_err();
    assert!(matches!(err, CollabError::TokenFetch(_)));
}

#[tokio::test]
async fn test_malformed_body_is_a_token_fetch_error() {
    let (addr, _requests) = spawn_endpoint("HTTP/1.1 200 OK", "not json".to_string()).await;

    let source = HttpCredentialSource::new(&format!("http://{addr}"));
    let err = source.fetch().await.unwrap_err();
    assert!(matches!(err, CollabError::TokenFetch(_)));
}

#[tokio::test]
async fn test_manager_caches_over_http() {
    let body = serde_json::json!({
        "csrfToken": "abc",
        "sessionId": "s1",
    })
    .to_string();
    let (addr, requests) = spawn_endpoint("HTTP/1.1 200 OK", body).await;

    let config = CollabConfig {
        server_url: format!("http://{addr}"),
        auto_refresh_token: false,
        ..CollabConfig::default()
    };
    let manager = TokenManager::new(&config);

    let first = manager.get_token(false).await.unwrap();
    let second = manager.get_token(false).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(requests.load(Ordering::SeqCst), 1);

    let third = manager.get_token(true).await.unwrap();
    assert_eq!(third.csrf_token, "abc");
    assert_eq!(requests.load(Ordering::SeqCst), 2);
}
