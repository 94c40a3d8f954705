mod common;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use common::{UpstreamMock, body_string, gateway_app, parse_sse, spawn_auth_mock, spawn_upstream_mock};
use serde_json::{Value, json};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tower::ServiceExt;

use kirogate::config::Config;

fn completions_request(key: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {key}"))
        .body(Body::from(body.to_string()))
        .expect("failed to build request")
}

fn single_tenant_config() -> Config {
    let mut cfg = Config::default();
    cfg.basic.proxy_api_key = "pwd".to_string();
    cfg.gateway.refresh_token = "seed-refresh".to_string();
    cfg.gateway.base_retry_delay = 0.01;
    cfg
}

#[tokio::test]
async fn missing_and_invalid_keys_are_rejected() {
    let upstream = UpstreamMock::always(StatusCode::OK, br#"{"content":"hi"}"#);
    let upstream_base = spawn_upstream_mock(upstream).await;
    let (auth_base, _auth) = spawn_auth_mock().await;
    let (app, _store, db_path) = gateway_app(single_tenant_config(), &upstream_base, &auth_base).await;

    // No Authorization header -> 401 in the OpenAI envelope.
    let resp = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/chat/completions")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"model":"m","messages":[]}"#))
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = serde_json::from_str(&body_string(resp.into_body()).await).unwrap();
    assert_eq!(body["error"]["type"], "kiro_api_error");
    assert_eq!(body["error"]["code"], 401);

    // Wrong key -> 401.
    let resp = app
        .clone()
        .oneshot(completions_request(
            "wrong",
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    // Correct key, invalid JSON -> 400.
    let resp = app
        .clone()
        .oneshot(completions_request("pwd", "not-json"))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Correct key, empty messages -> 400.
    let resp = app
        .oneshot(completions_request("pwd", r#"{"model":"m","messages":[]}"#))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn non_streaming_completion_round_trips() {
    let upstream = UpstreamMock::always(StatusCode::OK, br#"{"content":"Hello"}{"content":" world"}"#);
    let upstream_base = spawn_upstream_mock(upstream.clone()).await;
    let (auth_base, auth) = spawn_auth_mock().await;
    let (app, _store, db_path) = gateway_app(single_tenant_config(), &upstream_base, &auth_base).await;

    let resp = app
        .oneshot(completions_request(
            "pwd",
            r#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = serde_json::from_str(&body_string(resp.into_body()).await).unwrap();
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["role"], "assistant");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello world");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");
    assert!(body["usage"]["prompt_tokens"].as_u64().unwrap() > 0);

    // Exactly one refresh (first token acquisition) and one upstream call.
    assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(upstream.call_count(), 1);

    // The upstream payload carried the translated conversation.
    let payload = upstream.bodies.lock().unwrap()[0].clone();
    let message = &payload["conversationState"]["currentMessage"]["userInputMessage"];
    assert_eq!(message["content"], "hi");
    assert_eq!(message["origin"], "AI_EDITOR");
    assert_eq!(message["modelId"], "CLAUDE_SONNET_4_5_20250929_V1_0");
    assert_eq!(payload["conversationState"]["chatTriggerType"], "MANUAL");

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn streaming_completion_emits_chunks_and_done() {
    let upstream = UpstreamMock::always(StatusCode::OK, br#"{"content":"Hello"}{"content":" world"}"#);
    let upstream_base = spawn_upstream_mock(upstream).await;
    let (auth_base, _auth) = spawn_auth_mock().await;
    let (app, _store, db_path) = gateway_app(single_tenant_config(), &upstream_base, &auth_base).await;

    let resp = app
        .oneshot(completions_request(
            "pwd",
            r#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
        ))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .starts_with("text/event-stream")
    );

    let body = body_string(resp.into_body()).await;
    let events = parse_sse(&body);

    // Exactly one [DONE], and it is last.
    let done_count = events.iter().filter(|(_, data)| data == "[DONE]").count();
    assert_eq!(done_count, 1);
    assert_eq!(events.last().unwrap().1, "[DONE]");

    let chunks: Vec<Value> = events
        .iter()
        .filter(|(_, data)| data != "[DONE]")
        .map(|(_, data)| serde_json::from_str(data).expect("chunk json"))
        .collect();

    assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
    assert_eq!(chunks[1]["choices"][0]["delta"]["content"], "Hello");
    assert_eq!(chunks[2]["choices"][0]["delta"]["content"], " world");

    let terminal = chunks.last().unwrap();
    assert_eq!(terminal["choices"][0]["finish_reason"], "stop");
    assert!(terminal["usage"]["completion_tokens"].as_u64().unwrap() > 0);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn upstream_403_triggers_refresh_and_retry() {
    let upstream = UpstreamMock::scripted(vec![
        (StatusCode::FORBIDDEN, b"denied".to_vec()),
        (StatusCode::OK, br#"{"content":"ok"}"#.to_vec()),
    ]);
    let upstream_base = spawn_upstream_mock(upstream.clone()).await;
    let (auth_base, auth) = spawn_auth_mock().await;
    let (app, _store, db_path) = gateway_app(single_tenant_config(), &upstream_base, &auth_base).await;

    let resp = app
        .oneshot(completions_request(
            "pwd",
            r#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .expect("request failed");

    // The 403 never reaches the client.
    assert_eq!(resp.status(), StatusCode::OK);
    let body: Value = serde_json::from_str(&body_string(resp.into_body()).await).unwrap();
    assert_eq!(body["choices"][0]["message"]["content"], "ok");

    // One refresh for the initial token, one forced by the 403; the retry
    // carried the rotated token.
    assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 2);
    assert_eq!(upstream.call_count(), 2);
    let headers = upstream.auth_headers.lock().unwrap().clone();
    assert_eq!(headers, vec!["Bearer T1".to_string(), "Bearer T2".to_string()]);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn repeated_429_exhausts_with_502_and_backoff() {
    let upstream = UpstreamMock::always(StatusCode::TOO_MANY_REQUESTS, b"slow down");
    let upstream_base = spawn_upstream_mock(upstream.clone()).await;
    let (auth_base, _auth) = spawn_auth_mock().await;
    let (app, _store, db_path) = gateway_app(single_tenant_config(), &upstream_base, &auth_base).await;

    let start = Instant::now();
    let resp = app
        .oneshot(completions_request(
            "pwd",
            r#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .expect("request failed");
    let elapsed = start.elapsed();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(upstream.call_count(), 3);
    // Waits of ~0.01, 0.02, 0.04s between attempts.
    assert!(elapsed.as_millis() >= 70, "elapsed was {elapsed:?}");

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn user_api_key_uses_donated_token_and_records_usage() {
    let upstream = UpstreamMock::always(StatusCode::OK, br#"{"content":"hi there"}"#);
    let upstream_base = spawn_upstream_mock(upstream).await;
    let (auth_base, _auth) = spawn_auth_mock().await;

    let mut cfg = Config::default();
    cfg.basic.proxy_api_key = "pwd".to_string();
    let (app, store, db_path) = gateway_app(cfg, &upstream_base, &auth_base).await;

    let now = chrono::Utc::now();
    let user_id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO users (username, is_banned, created_at) VALUES ('alice', 0, ?) RETURNING id",
    )
    .bind(now)
    .fetch_one(store.pool())
    .await
    .unwrap();
    sqlx::query("INSERT INTO api_keys (user_id, api_key, created_at) VALUES (?, 'sk-alice1', ?)")
        .bind(user_id)
        .bind(now)
        .execute(store.pool())
        .await
        .unwrap();
    let token_id = sqlx::query_scalar::<_, i64>(
        "INSERT INTO donated_tokens (owner_user_id, refresh_token, created_at) VALUES (?, 'donated-r1', ?) RETURNING id",
    )
    .bind(user_id)
    .bind(now)
    .fetch_one(store.pool())
    .await
    .unwrap();

    let resp = app
        .clone()
        .oneshot(completions_request(
            "sk-alice1",
            r#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);

    let (success, fail): (i64, i64) = sqlx::query_as(
        "SELECT success_count, fail_count FROM donated_tokens WHERE id = ?",
    )
    .bind(token_id)
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!((success, fail), (1, 0));

    // Unknown sk- key -> 401; user with no tokens -> 503.
    let resp = app
        .clone()
        .oneshot(completions_request(
            "sk-nobody",
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    sqlx::query("UPDATE donated_tokens SET status = 'invalid' WHERE id = ?")
        .bind(token_id)
        .execute(store.pool())
        .await
        .unwrap();
    let resp = app
        .clone()
        .oneshot(completions_request(
            "sk-alice1",
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    // Banned users are refused outright.
    sqlx::query("UPDATE users SET is_banned = 1 WHERE id = ?")
        .bind(user_id)
        .execute(store.pool())
        .await
        .unwrap();
    let resp = app
        .oneshot(completions_request(
            "sk-alice1",
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn multi_tenant_key_routes_through_auth_cache() {
    let upstream = UpstreamMock::always(StatusCode::OK, br#"{"content":"tenant reply"}"#);
    let upstream_base = spawn_upstream_mock(upstream).await;
    let (auth_base, auth) = spawn_auth_mock().await;

    let mut cfg = Config::default();
    cfg.basic.proxy_api_key = "pwd".to_string();
    let (app, _store, db_path) = gateway_app(cfg, &upstream_base, &auth_base).await;

    let resp = app
        .clone()
        .oneshot(completions_request(
            "pwd:tenant-refresh-token",
            r#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 1);

    // Same tenant again: cached manager, no second refresh.
    let resp = app
        .clone()
        .oneshot(completions_request(
            "pwd:tenant-refresh-token",
            r#"{"model":"claude-sonnet-4-5","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(auth.refresh_calls.load(Ordering::SeqCst), 1);

    // Bad proxy part -> 401.
    let resp = app
        .oneshot(completions_request(
            "nope:tenant-refresh-token",
            r#"{"model":"m","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn models_endpoint_lists_static_catalog() {
    let upstream = UpstreamMock::always(StatusCode::OK, b"");
    let upstream_base = spawn_upstream_mock(upstream).await;
    let (auth_base, _auth) = spawn_auth_mock().await;
    let (app, _store, db_path) = gateway_app(single_tenant_config(), &upstream_base, &auth_base).await;

    let resp = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/v1/models")
                .header("authorization", "Bearer pwd")
                .body(Body::empty())
                .expect("failed to build request"),
        )
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);

    let body: Value = serde_json::from_str(&body_string(resp.into_body()).await).unwrap();
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"claude-sonnet-4-5"));
    assert_eq!(body["data"][0]["object"], "model");

    let _ = std::fs::remove_file(&db_path);
}

#[tokio::test]
async fn oversized_tool_description_reaches_upstream_hoisted() {
    let upstream = UpstreamMock::always(StatusCode::OK, br#"{"content":"ok"}"#);
    let upstream_base = spawn_upstream_mock(upstream.clone()).await;
    let (auth_base, _auth) = spawn_auth_mock().await;
    let (app, _store, db_path) = gateway_app(single_tenant_config(), &upstream_base, &auth_base).await;

    let long_description = "d".repeat(5000);
    let request_body = json!({
        "model": "claude-sonnet-4-5",
        "messages": [{"role": "user", "content": "run it"}],
        "tools": [{
            "type": "function",
            "function": {"name": "bash", "description": long_description, "parameters": {"type": "object"}}
        }]
    });

    let resp = app
        .oneshot(completions_request("pwd", &request_body.to_string()))
        .await
        .expect("request failed");
    assert_eq!(resp.status(), StatusCode::OK);

    let payload = upstream.bodies.lock().unwrap()[0].clone();
    let message = &payload["conversationState"]["currentMessage"]["userInputMessage"];
    let content = message["content"].as_str().unwrap();
    assert!(content.contains("## Tool: bash"));
    assert!(content.contains(&"d".repeat(5000)));

    let description = message["userInputMessageContext"]["tools"][0]["toolSpecification"]
        ["description"]
        .as_str()
        .unwrap();
    assert_eq!(
        description,
        "[Full documentation in system prompt under '## Tool: bash']"
    );

    let _ = std::fs::remove_file(&db_path);
}
