mod common;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::post,
};
use common::spawn_test_server;
use serde_json::{Value, json};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use tokio::task::JoinSet;

use kirogate::auth::{CredentialManager, RefreshCredentials, RefreshEndpoints};
use kirogate::error::GatewayError;

/// Mock refresh endpoint that rotates tokens and can fail on a script.
#[derive(Clone)]
struct RefreshMock {
    calls: Arc<AtomicUsize>,
    failures: Arc<Mutex<Vec<StatusCode>>>,
}

impl RefreshMock {
    fn new(failures: Vec<StatusCode>) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            failures: Arc::new(Mutex::new(failures)),
        }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn refresh_handler(State(mock): State<RefreshMock>) -> (StatusCode, Json<Value>) {
    let n = mock.calls.fetch_add(1, Ordering::SeqCst) + 1;

    let failure = mock.failures.lock().unwrap().pop();
    if let Some(status) = failure {
        return (status, Json(json!({"error": "scripted failure"})));
    }

    (
        StatusCode::OK,
        Json(json!({
            "accessToken": format!("A{n}"),
            "refreshToken": format!("R{n}"),
            "expiresIn": 3600,
        })),
    )
}

async fn spawn_refresh_mock(mock: RefreshMock) -> RefreshEndpoints {
    let app = Router::new()
        .route("/refreshToken", post(refresh_handler))
        .route("/token", post(refresh_handler))
        .with_state(mock);
    let base = spawn_test_server(app).await;
    RefreshEndpoints::for_base(&base)
}

fn manager_against(endpoints: RefreshEndpoints) -> CredentialManager {
    CredentialManager::new(
        RefreshCredentials::social("seed-refresh", "us-east-1"),
        reqwest::Client::new(),
        endpoints,
        300,
    )
}

#[tokio::test]
async fn token_is_cached_until_forced() {
    let mock = RefreshMock::new(vec![]);
    let endpoints = spawn_refresh_mock(mock.clone()).await;
    let manager = manager_against(endpoints);

    let first = manager.get_access_token().await.unwrap();
    assert_eq!(first, "A1");
    assert_eq!(mock.call_count(), 1);

    // A fresh token is served from memory.
    let second = manager.get_access_token().await.unwrap();
    assert_eq!(second, "A1");
    assert_eq!(mock.call_count(), 1);

    // force_refresh always hits the endpoint.
    let third = manager.force_refresh().await.unwrap();
    assert_eq!(third, "A2");
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test]
async fn concurrent_callers_share_one_refresh() {
    let mock = RefreshMock::new(vec![]);
    let endpoints = spawn_refresh_mock(mock.clone()).await;
    let manager = Arc::new(manager_against(endpoints));

    let mut tasks = JoinSet::new();
    for _ in 0..8 {
        let manager = manager.clone();
        tasks.spawn(async move { manager.get_access_token().await });
    }

    while let Some(result) = tasks.join_next().await {
        let token = result.unwrap().unwrap();
        assert_eq!(token, "A1");
    }
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn transient_refresh_failures_are_retried() {
    let mock = RefreshMock::new(vec![StatusCode::SERVICE_UNAVAILABLE]);
    let endpoints = spawn_refresh_mock(mock.clone()).await;
    let manager = manager_against(endpoints);

    let token = manager.get_access_token().await.unwrap();
    assert_eq!(token, "A2");
    assert_eq!(mock.call_count(), 2);
}

#[tokio::test]
async fn terminal_rejection_fails_without_retry() {
    let mock = RefreshMock::new(vec![StatusCode::BAD_REQUEST]);
    let endpoints = spawn_refresh_mock(mock.clone()).await;
    let manager = manager_against(endpoints);

    let err = manager.get_access_token().await.unwrap_err();
    assert!(matches!(err, GatewayError::AuthRejected { status, .. }
        if status == StatusCode::BAD_REQUEST));
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn refresh_persists_to_creds_file_preserving_unknown_keys() {
    let mock = RefreshMock::new(vec![]);
    let endpoints = spawn_refresh_mock(mock.clone()).await;

    let (_, mut creds_path) = {
        let url = common::unique_sqlite_url("creds");
        (url.0, url.1)
    };
    creds_path.set_extension("json");
    std::fs::write(
        &creds_path,
        serde_json::to_string(&json!({
            "refreshToken": "file-refresh",
            "region": "us-east-1",
            "customField": "keep-me"
        }))
        .unwrap(),
    )
    .unwrap();

    let manager = CredentialManager::new(
        RefreshCredentials::social("seed-ignored", "us-east-1"),
        reqwest::Client::new(),
        endpoints,
        300,
    )
    .with_creds_file(&creds_path);

    let token = manager.get_access_token().await.unwrap();
    assert_eq!(token, "A1");

    let saved: Value =
        serde_json::from_str(&std::fs::read_to_string(&creds_path).unwrap()).unwrap();
    assert_eq!(saved["accessToken"], "A1");
    // The endpoint rotated the refresh token; the file follows.
    assert_eq!(saved["refreshToken"], "R1");
    assert_eq!(saved["customField"], "keep-me");
    assert!(saved["expiresAt"].as_str().is_some());

    let _ = std::fs::remove_file(&creds_path);
}
