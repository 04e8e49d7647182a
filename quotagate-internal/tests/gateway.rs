//! End-to-end tests for the gateway router, using the in-memory counter
//! store and the dummy completion provider.

use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use quotagate_internal::completion::DummyCompletionClient;
use quotagate_internal::config_parser::Config;
use quotagate_internal::endpoints::build_router;
use quotagate_internal::gateway_util::AppStateData;

async fn test_router(config_toml: &str) -> Router {
    let config = Arc::new(Config::load_from_str(config_toml).unwrap());
    let state = AppStateData::new(config).await.unwrap();
    build_router(state)
}

async fn send_json(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value, HeaderMap) {
    let request = match body {
        Some(body) => Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap(),
    };

    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value, headers)
}

fn completion_body(user: &str, content: &str) -> Value {
    json!({
        "user": user,
        "messages": [{"role": "user", "content": content}],
    })
}

#[tokio::test]
async fn test_completion_happy_path() {
    let router = test_router("").await;

    let (status, body, headers) = send_json(
        &router,
        "POST",
        "/v1/chat/completions",
        // 5 words -> dummy usage reports 5 prompt + 7 completion tokens
        Some(completion_body("u1", "hello from the integration test")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "primary");
    assert_eq!(body["model"], "dummy-primary");
    assert_eq!(body["tokens_used"], 12);
    assert!(body["content"].as_str().unwrap().contains("primary"));
    assert!(body["id"].as_str().is_some());

    // One request slot consumed out of the 30/minute default
    assert_eq!(body["remaining"]["rpm"], 29);
    assert_eq!(body["remaining"]["identity_rpd"], 49);
    assert_eq!(body["remaining"]["identity_tpd"], 20_000 - 12);
    assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "29");
}

#[tokio::test]
async fn test_missing_identity_is_rejected() {
    let router = test_router("").await;

    let (status, body, _) = send_json(
        &router,
        "POST",
        "/v1/chat/completions",
        Some(json!({"messages": [{"role": "user", "content": "hi"}]})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn test_identity_header_fallback() {
    let router = test_router("").await;

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-quotagate-identity", "header-user")
        .body(Body::from(
            json!({"messages": [{"role": "user", "content": "hi"}]}).to_string(),
        ))
        .unwrap();
    let response = router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (_, quota, _) = send_json(&router, "GET", "/v1/quota/header-user", None).await;
    assert_eq!(quota["usage"]["identity_rpd"], 1);
}

#[tokio::test]
async fn test_empty_messages_rejected() {
    let router = test_router("").await;

    let (status, _, _) = send_json(
        &router,
        "POST",
        "/v1/chat/completions",
        Some(json!({"user": "u1", "messages": []})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_identity_rpd_exhaustion_returns_429_with_reason() {
    let router = test_router(
        r#"
        [limits.identity]
        requests_per_day = 2
        "#,
    )
    .await;

    for _ in 0..2 {
        let (status, _, _) = send_json(
            &router,
            "POST",
            "/v1/chat/completions",
            Some(completion_body("u1", "hi there")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body, headers) = send_json(
        &router,
        "POST",
        "/v1/chat/completions",
        Some(completion_body("u1", "hi there")),
    )
    .await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["reason"], "identity_rpd");
    assert_eq!(body["remaining"]["identity_rpd"], 0);
    assert!(headers.contains_key("Retry-After"));

    // A different identity is unaffected
    let (status, _, _) = send_json(
        &router,
        "POST",
        "/v1/chat/completions",
        Some(completion_body("u2", "hi there")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_quota_status_reflects_reconciled_tokens() {
    let router = test_router("").await;

    send_json(
        &router,
        "POST",
        "/v1/chat/completions",
        // 3 words -> 3 + 7 = 10 actual tokens from the dummy provider
        Some(completion_body("u1", "one two three")),
    )
    .await;

    let (status, body, _) = send_json(&router, "GET", "/v1/quota/u1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["identity"], "u1");
    assert_eq!(body["usage"]["rpm"], 1);
    assert_eq!(body["usage"]["identity_rpd"], 1);
    assert_eq!(body["usage"]["identity_tpd"], 10);
    assert_eq!(body["usage"]["tpd"], 10);
    assert_eq!(body["limits"]["identity_tpd"], 20_000);
}

#[tokio::test]
async fn test_estimate_substitutes_for_missing_provider_usage() {
    // A provider that omits usage data forces the router to account with the
    // pre-call estimate instead
    let config = Arc::new(Config::default());
    let mut state = AppStateData::new(config).await.unwrap();
    state.completion_client = Arc::new(DummyCompletionClient::without_usage());
    let router = build_router(state);

    let (status, body, _) = send_json(
        &router,
        "POST",
        "/v1/chat/completions",
        // 4 words -> estimate ceil(0.75 * 4) = 3
        Some(completion_body("u1", "one two three four")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tokens_used"], 3);

    let (_, quota, _) = send_json(&router, "GET", "/v1/quota/u1", None).await;
    assert_eq!(quota["usage"]["identity_tpd"], 3);
}

#[tokio::test]
async fn test_caller_tier_preference_is_honored_when_quiet() {
    let router = test_router("").await;

    let (status, body, _) = send_json(
        &router,
        "POST",
        "/v1/chat/completions",
        Some(json!({
            "user": "u1",
            "messages": [{"role": "user", "content": "hi"}],
            "tier": "degraded",
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tier"], "degraded");
    assert_eq!(body["model"], "dummy-degraded");
}

#[tokio::test]
async fn test_grants_raise_the_identity_ceiling() {
    let router = test_router("").await;

    let (status, body, _) = send_json(
        &router,
        "POST",
        "/v1/quota/u9/grants",
        Some(json!({"tokens": 5000, "source": "purchase", "reference": "receipt-1"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["granted_today"], 5000);
    assert_eq!(body["tokens_granted"], 5000);

    let (status, body, _) = send_json(
        &router,
        "POST",
        "/v1/quota/u9/grants",
        Some(json!({"tokens": 100, "source": "ad_reward"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["granted_today"], 5100);

    let (_, quota, _) = send_json(&router, "GET", "/v1/quota/u9", None).await;
    assert_eq!(quota["limits"]["identity_tpd"], 25_100);
}

#[tokio::test]
async fn test_zero_token_grant_rejected() {
    let router = test_router("").await;

    let (status, body, _) = send_json(
        &router,
        "POST",
        "/v1/quota/u9/grants",
        Some(json!({"tokens": 0, "source": "purchase"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn test_health_and_status_endpoints() {
    let router = test_router("").await;

    let (status, body, _) = send_json(&router, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    send_json(
        &router,
        "POST",
        "/v1/chat/completions",
        Some(completion_body("u1", "hi")),
    )
    .await;

    let (status, body, _) = send_json(&router, "GET", "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ledger"]["admitted"], 1);
    assert_eq!(body["ledger"]["rejected"], 0);
    assert!(body["version"].as_str().is_some());
}
