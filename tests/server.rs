//! Integration tests for the HTTP boundary.
//!
//! Verifies that:
//! - The master key gates every path except /health
//! - Chat completions are served as JSON with provenance headers
//! - Dispatch errors map to typed, machine-readable error bodies
//! - Streaming requests are served as SSE terminated by [DONE]
//! - /v1/models lists configured exact aliases

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use http::{Request, StatusCode};
use tower::ServiceExt;

use modelgate::adapter::{AdapterRegistry, Capabilities, EchoAdapter};
use modelgate::config::Config;
use modelgate::credentials::{ApiKey, CredentialRef};
use modelgate::dispatch::Dispatcher;
use modelgate::registry::{ModelEntry, ModelRegistry};
use modelgate::router::Router as ModelRouter;
use modelgate::server::{build_dispatcher, create_router, AppState};

const MASTER_KEY: &str = "sk-master-test";

fn entry(alias: &str, provider: &str, model: &str) -> ModelEntry {
    ModelEntry::new(
        alias,
        provider,
        model,
        CredentialRef::Inline(ApiKey::from("sk-test")),
    )
}

fn setup_app(master_key: Option<&str>) -> axum::Router {
    let registry = ModelRegistry::from_entries(vec![
        entry("gpt-4", "echo", "echo-large"),
        entry("gpt-4", "echo", "echo-large"),
        entry("no-tools", "limited", "limited-1"),
    ])
    .unwrap();
    let adapters = AdapterRegistry::new()
        .with(Arc::new(EchoAdapter::new("echo")))
        .with(Arc::new(
            EchoAdapter::new("limited").with_capabilities(Capabilities::none()),
        ));
    let dispatcher = Dispatcher::new(Arc::new(ModelRouter::new(registry)), adapters);

    let state =
        AppState::new(Arc::new(dispatcher)).with_master_key(master_key.map(ApiKey::from));
    create_router(state)
}

fn chat(body: serde_json::Value, key: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json");
    if let Some(key) = key {
        builder = builder.header("authorization", format!("Bearer {}", key));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_health_is_public() {
    let app = setup_app(Some(MASTER_KEY));
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["models"], 3);
    assert_eq!(json["providers"], serde_json::json!(["echo", "limited"]));
}

#[tokio::test]
async fn test_missing_master_key_rejected() {
    let app = setup_app(Some(MASTER_KEY));
    let request = chat(
        serde_json::json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
        None,
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "unauthorized");
}

#[tokio::test]
async fn test_wrong_master_key_rejected() {
    let app = setup_app(Some(MASTER_KEY));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .header("authorization", "Bearer sk-guess")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_near_miss_master_keys_rejected() {
    let app = setup_app(Some(MASTER_KEY));
    for key in ["sk-master-tesX", "sk-master-test-extra", "sk-master-tes", ""] {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .header("authorization", format!("Bearer {}", key))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "key {:?}", key);
    }

    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .header("authorization", format!("Bearer {}", MASTER_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_chat_completion_echoes_with_headers() {
    let app = setup_app(Some(MASTER_KEY));
    let request = chat(
        serde_json::json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "ping pong"}]
        }),
        Some(MASTER_KEY),
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers.get("x-modelgate-provider").unwrap(), "echo");
    assert_eq!(headers.get("x-modelgate-model").unwrap(), "echo-large");
    assert!(headers.get("x-modelgate-latency-ms").is_some());

    let json = body_json(response).await;
    assert_eq!(json["choices"][0]["message"]["content"], "ping pong");
    assert_eq!(json["model"], "echo-large");
}

#[tokio::test]
async fn test_no_master_key_configured_allows_requests() {
    let app = setup_app(None);
    let request = chat(
        serde_json::json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
        None,
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_unknown_model_is_bad_request() {
    let app = setup_app(None);
    let request = chat(
        serde_json::json!({"model": "claude", "messages": [{"role": "user", "content": "hi"}]}),
        None,
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "unknown_model");
    assert_eq!(json["error"]["code"], 400);
}

#[tokio::test]
async fn test_malformed_body_is_invalid_request() {
    let app = setup_app(None);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"messages": "not a list"}"#))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "invalid_request");
}

#[tokio::test]
async fn test_exhaustion_lists_attempts() {
    let app = setup_app(None);
    let request = chat(
        serde_json::json!({
            "model": "no-tools",
            "messages": [{"role": "user", "content": "hi"}],
            "tool_choice": "auto"
        }),
        None,
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(
        response.headers().get("x-modelgate-attempts").unwrap(),
        "limited/limited-1 (unsupported_feature)"
    );
    let json = body_json(response).await;
    assert_eq!(json["error"]["type"], "all_candidates_failed");
    let attempts = json["error"]["attempts"].as_array().unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0]["provider"], "limited");
    assert_eq!(attempts[0]["kind"], "unsupported_feature");
    assert_eq!(attempts[0]["credential"], "inline");
}

#[tokio::test]
async fn test_streaming_response_is_sse() {
    let app = setup_app(None);
    let request = chat(
        serde_json::json!({
            "model": "gpt-4",
            "stream": true,
            "messages": [{"role": "user", "content": "one two three"}]
        }),
        None,
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(response.headers().get("x-modelgate-streaming").unwrap(), "true");

    let text = body_text(response).await;
    assert!(text.ends_with("data: [DONE]\n\n"), "stream: {}", text);

    let content: String = text
        .split("\n\n")
        .filter_map(|event| event.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .filter_map(|data| serde_json::from_str::<serde_json::Value>(data).ok())
        .filter_map(|chunk| chunk["choices"][0]["delta"]["content"].as_str().map(str::to_string))
        .collect();
    assert_eq!(content, "one two three");
}

#[tokio::test]
async fn test_list_models() {
    let app = setup_app(Some(MASTER_KEY));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .header("authorization", format!("Bearer {}", MASTER_KEY))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["object"], "list");
    let ids: Vec<&str> = json["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["gpt-4", "no-tools"]);
    assert_eq!(json["data"][0]["owned_by"], "echo");
}

#[tokio::test]
async fn test_concurrency_limit_serves_requests() {
    let registry = ModelRegistry::from_entries(vec![entry("gpt-4", "echo", "echo-large")]).unwrap();
    let dispatcher = Dispatcher::new(
        Arc::new(ModelRouter::new(registry)),
        AdapterRegistry::new().with(Arc::new(EchoAdapter::new("echo"))),
    );
    let app = create_router(AppState::new(Arc::new(dispatcher)).with_concurrency_limit(Some(1)));

    for _ in 0..3 {
        let request = chat(
            serde_json::json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
            None,
        );
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit_is_shared_across_routes() {
    let registry = ModelRegistry::from_entries(vec![entry("gpt-4", "echo", "echo-large")]).unwrap();
    let dispatcher = Dispatcher::new(
        Arc::new(ModelRouter::new(registry)),
        AdapterRegistry::new()
            .with(Arc::new(EchoAdapter::new("echo").with_delay(Duration::from_secs(10)))),
    );
    let app = create_router(AppState::new(Arc::new(dispatcher)).with_concurrency_limit(Some(1)));
    let health = || Request::builder().uri("/health").body(Body::empty()).unwrap();

    let slow = tokio::spawn(app.clone().oneshot(chat(
        serde_json::json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}),
        None,
    )));
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // The in-flight completion holds the only slot, so /health has to wait
    let blocked = tokio::time::timeout(Duration::from_secs(1), app.clone().oneshot(health())).await;
    assert!(blocked.is_err());

    let response = slow.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app.oneshot(health()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_dispatcher_built_from_config() {
    let toml = r#"
        [[models]]
        alias = "*"
        provider = "echo"
        model = "*"

        [callbacks]
        success = ["usage_log"]
    "#;
    let config = Config::parse_str_with(toml, |_| None).unwrap();
    let dispatcher = build_dispatcher(&config).unwrap();
    let app = create_router(AppState::new(Arc::new(dispatcher)));

    let request = chat(
        serde_json::json!({"model": "anything", "messages": [{"role": "user", "content": "hi"}]}),
        None,
    );
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["model"], "anything");
}
