//! Exercises `HttpCredentialSource` against a local token endpoint that mints
//! real LiveKit join tokens.

use axum::extract::Query;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use livekit_api::access_token::{AccessToken, VideoGrants};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use voxlink_credentials::{
    CredentialError, CredentialOptions, CredentialProvider, CredentialSettings, CredentialSource,
    HttpCredentialSource,
};
use voxlink_runtime::SystemClock;

const API_KEY: &str = "devkey";
const API_SECRET: &str = "secret";

async fn issue_token(
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let Some(user_id) = headers.get("x-user-id").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "missing user" })));
    };
    if user_id == "banned" {
        return (StatusCode::FORBIDDEN, Json(json!({ "error": "forbidden" })));
    }

    let provider = params.get("provider").cloned().unwrap_or_default();
    let room = format!("voice-{provider}");
    let token = AccessToken::with_api_key(API_KEY, API_SECRET)
        .with_identity(user_id)
        .with_name(user_id)
        .with_grants(VideoGrants {
            room_join: true,
            room: room.clone(),
            can_publish: true,
            can_subscribe: true,
            can_publish_data: true,
            ..Default::default()
        })
        .with_ttl(Duration::from_secs(600))
        .to_jwt()
        .unwrap_or_default();

    (
        StatusCode::OK,
        Json(json!({
            "serverUrl": "ws://localhost:7880",
            "roomName": room,
            "participantName": user_id,
            "participantToken": token,
            "expires_at": chrono::Utc::now().timestamp() + 600,
        })),
    )
}

async fn unavailable() -> impl IntoResponse {
    StatusCode::SERVICE_UNAVAILABLE
}

async fn garbage() -> impl IntoResponse {
    (StatusCode::OK, "<html>not json</html>")
}

async fn spawn_endpoint() -> String {
    let app = Router::new()
        .route("/token", get(issue_token))
        .route("/down", get(unavailable))
        .route("/garbage", get(garbage));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

fn options(provider: &str) -> CredentialOptions {
    CredentialOptions {
        provider: Some(provider.to_string()),
        voice_id: Some("v1".to_string()),
    }
}

#[tokio::test]
async fn fetches_and_decodes_credential() {
    let base = spawn_endpoint().await;
    let source = HttpCredentialSource::new(format!("{base}/token"), Duration::from_secs(5)).unwrap();

    let credential = source.fetch("alice", &options("openai")).await.unwrap();

    assert_eq!(credential.room_name, "voice-openai");
    assert_eq!(credential.participant_name, "alice");
    assert_eq!(credential.server_url, "ws://localhost:7880");
    assert_eq!(credential.value.split('.').count(), 3, "expected a JWT");
    let expires_at = credential.expires_at_ms.expect("expiry should be reported");
    assert!(expires_at > chrono::Utc::now().timestamp_millis());
}

#[tokio::test]
async fn forbidden_is_fatal() {
    let base = spawn_endpoint().await;
    let source = HttpCredentialSource::new(format!("{base}/token"), Duration::from_secs(5)).unwrap();

    let err = source.fetch("banned", &options("openai")).await.unwrap_err();
    assert_eq!(err, CredentialError::Unauthorized { status: 403 });
    assert!(err.is_fatal());
}

#[tokio::test]
async fn server_errors_and_bad_bodies_are_transient() {
    let base = spawn_endpoint().await;

    let down = HttpCredentialSource::new(format!("{base}/down"), Duration::from_secs(5)).unwrap();
    let err = down.fetch("alice", &options("x")).await.unwrap_err();
    assert_eq!(err, CredentialError::Http { status: 503 });
    assert!(!err.is_fatal());

    let garbage = HttpCredentialSource::new(format!("{base}/garbage"), Duration::from_secs(5)).unwrap();
    let err = garbage.fetch("alice", &options("x")).await.unwrap_err();
    assert!(matches!(err, CredentialError::Decode(_)));
    assert!(!err.is_fatal());
}

#[tokio::test]
async fn refused_connection_is_transient() {
    // Bind then drop to get a port nothing listens on.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = HttpCredentialSource::new(format!("http://{addr}/token"), Duration::from_secs(2)).unwrap();
    let err = source.fetch("alice", &options("x")).await.unwrap_err();
    assert!(matches!(err, CredentialError::Request(_)));
}

#[tokio::test]
async fn provider_caches_http_credential() {
    let base = spawn_endpoint().await;
    let settings = CredentialSettings {
        token_url: format!("{base}/token"),
        provider: Some("openai".to_string()),
        ..CredentialSettings::default()
    };
    let source = Arc::new(
        HttpCredentialSource::new(settings.token_url.clone(), settings.request_timeout()).unwrap(),
    );
    let provider = CredentialProvider::new(source, &settings, Arc::new(SystemClock));

    let first = provider.get_valid_credential("alice").await.unwrap();
    let second = provider.get_valid_credential("alice").await.unwrap();
    assert_eq!(first, second);
    assert!(provider.refresh_scheduled());

    provider.clear();
    assert!(!provider.refresh_scheduled());
}
