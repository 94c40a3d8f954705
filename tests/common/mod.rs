//! Shared helpers for router-level tests: a mock refresh endpoint, a mock
//! CodeWhisperer endpoint, and state wiring against temp SQLite files.

#![allow(dead_code)]

use axum::{
    Router,
    body::{Body, to_bytes},
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use serde_json::{Value, json};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use url::Url;

use kirogate::config::Config;
use kirogate::db::{SqliteStore, connect};
use kirogate::server::{GatewayState, gateway_router};

pub fn unique_sqlite_url(prefix: &str) -> (String, std::path::PathBuf) {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before UNIX_EPOCH")
        .as_nanos();

    let mut temp_path = std::env::temp_dir();
    temp_path.push(format!(
        "kirogate-{prefix}-{}-{}.sqlite",
        std::process::id(),
        nanos
    ));
    (format!("sqlite:{}", temp_path.display()), temp_path)
}

pub async fn spawn_test_server(app: Router) -> Url {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind listener");
    let addr = listener.local_addr().expect("local addr");
    let base = Url::parse(&format!("http://{}", addr)).expect("valid base url");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server run");
    });

    base
}

/// Mock auth server: answers both refresh dialects with `T<n>` tokens and
/// counts calls.
#[derive(Clone, Default)]
pub struct AuthMock {
    pub refresh_calls: Arc<AtomicUsize>,
}

async fn refresh_handler(State(mock): State<AuthMock>) -> (StatusCode, axum::Json<Value>) {
    let n = mock.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
    (
        StatusCode::OK,
        axum::Json(json!({
            "accessToken": format!("T{n}"),
            "expiresIn": 3600,
        })),
    )
}

pub async fn spawn_auth_mock() -> (Url, AuthMock) {
    let mock = AuthMock::default();
    let app = Router::new()
        .route("/refreshToken", post(refresh_handler))
        .route("/token", post(refresh_handler))
        .with_state(mock.clone());
    let base = spawn_test_server(app).await;
    (base, mock)
}

/// Scripted upstream: pops one `(status, body)` per call, repeating the last
/// entry once the script is exhausted. Captures authorization headers and
/// request bodies.
#[derive(Clone)]
pub struct UpstreamMock {
    pub script: Arc<Mutex<Vec<(StatusCode, Vec<u8>)>>>,
    pub calls: Arc<AtomicUsize>,
    pub auth_headers: Arc<Mutex<Vec<String>>>,
    pub bodies: Arc<Mutex<Vec<Value>>>,
}

impl UpstreamMock {
    pub fn scripted(script: Vec<(StatusCode, Vec<u8>)>) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
            calls: Arc::new(AtomicUsize::new(0)),
            auth_headers: Arc::new(Mutex::new(Vec::new())),
            bodies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn always(status: StatusCode, body: &[u8]) -> Self {
        Self::scripted(vec![(status, body.to_vec())])
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

async fn generate_handler(
    State(mock): State<UpstreamMock>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    mock.calls.fetch_add(1, Ordering::SeqCst);
    mock.auth_headers.lock().unwrap().push(
        headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    );
    if let Ok(json_body) = serde_json::from_slice::<Value>(&body) {
        mock.bodies.lock().unwrap().push(json_body);
    }

    let (status, payload) = {
        let mut script = mock.script.lock().unwrap();
        if script.len() > 1 {
            script.remove(0)
        } else {
            script.first().cloned().unwrap_or((StatusCode::OK, Vec::new()))
        }
    };
    (status, payload)
}

pub async fn spawn_upstream_mock(mock: UpstreamMock) -> Url {
    let app = Router::new()
        .route("/generateAssistantResponse", post(generate_handler))
        .with_state(mock);
    spawn_test_server(app).await
}

/// Full gateway app against the given mocks plus a fresh temp database.
pub async fn gateway_app(
    mut config: Config,
    upstream_base: &Url,
    auth_base: &Url,
) -> (Router, Arc<SqliteStore>, std::path::PathBuf) {
    if config.basic.proxy_api_key.is_empty() {
        config.basic.proxy_api_key = "pwd".to_string();
    }
    let (db_url, db_path) = unique_sqlite_url("route");
    let pool = connect(&db_url).await.expect("temp sqlite");
    let store = Arc::new(SqliteStore::new(pool));

    let state = GatewayState::with_bases(config, store.clone(), upstream_base, auth_base);
    (gateway_router(state), store, db_path)
}

pub async fn body_string(body: Body) -> String {
    let bytes = to_bytes(body, usize::MAX).await.expect("read body");
    String::from_utf8_lossy(&bytes).to_string()
}

/// Parse an SSE body into `(event_name, data_json_or_text)` pairs.
pub fn parse_sse(body: &str) -> Vec<(Option<String>, String)> {
    let mut events = Vec::new();
    for frame in body.split("\n\n") {
        let mut name = None;
        let mut data_lines = Vec::new();
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                name = Some(rest.trim().to_string());
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.trim_start().to_string());
            }
        }
        if !data_lines.is_empty() {
            events.push((name, data_lines.join("\n")));
        }
    }
    events
}
