//! HTTP API tests driven through the router with `tower::ServiceExt`.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use common::{Harness, SHA_A};
use defense_kb::server::router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(h: &Harness) -> Router {
    router(h.service.app_state())
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn synced() -> Harness {
    let h = Harness::new();
    assert!(h.service.orchestrator.run_sync().await);
    h
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_health_before_and_after_sync() {
    let h = Harness::new();

    let (status, _, body) = send(app(&h), get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "never_initialized");

    assert!(h.service.orchestrator.run_sync().await);

    let (status, _, body) = send(app(&h), get("/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ready");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_query_before_sync_is_not_ready() {
    let h = Harness::new();

    let (status, headers, body) = send(
        app(&h),
        post_json("/api/v1/query", json!({ "query": "prompt injection" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "not_ready");
    assert_eq!(headers[header::RETRY_AFTER], "5");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_first_sync_in_progress() {
    let h = Harness::new();
    h.embedder.gate.arm();
    let orchestrator = h.service.orchestrator.clone();
    let task = tokio::spawn(async move { orchestrator.sync().await });
    h.embedder.gate.entered().await;

    let (status, _, body) = send(app(&h), get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["status"], "initializing");

    let (status, headers, body) = send(
        app(&h),
        post_json("/api/v1/query", json!({ "query": "prompt injection" })),
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "temporarily_unavailable");
    assert!(headers.contains_key(header::RETRY_AFTER));

    let (status, _, body) = send(app(&h), post_json("/api/v1/sync", json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["code"], "sync_in_progress");

    h.embedder.gate.release();
    assert!(task.await.unwrap().is_success());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_query() {
    let h = synced().await;

    let (status, _, body) = send(
        app(&h),
        post_json("/api/v1/query", json!({ "query": "prompt injection", "top_k": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let results = body["results"].as_array().unwrap();
    assert_eq!(results.len(), 3);
    assert!(results[0]["id"].as_str().unwrap().starts_with("AID-"));
    assert!(results[0]["score"].is_number());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_query_validation() {
    let h = synced().await;

    let (status, _, body) = send(
        app(&h),
        post_json("/api/v1/query", json!({ "query": "<script>alert(1)</script>" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "bad_request");

    let (status, _, _) = send(
        app(&h),
        post_json("/api/v1/query", json!({ "query": "prompt", "top_k": 0 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = send(
        app(&h),
        post_json("/api/v1/query", json!({ "query": "   " })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_documents() {
    let h = synced().await;

    let (status, _, body) = send(app(&h), get("/api/v1/documents/AID-H-002")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["source_id"], "AID-H-002");
    assert_eq!(body["tactic"], "Harden");

    let (status, _, body) = send(app(&h), get("/api/v1/documents/AID-H-999")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ids_and_suggestions() {
    let h = synced().await;

    let (status, _, body) = send(app(&h), get("/api/v1/ids")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 480);
    assert_eq!(body["ids"].as_array().unwrap().len(), 480);

    let (status, _, body) = send(app(&h), get("/api/v1/ids/aid-m-01/suggestions?k=3")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["query"], "AID-M-01");
    assert_eq!(body["well_formed"], false);
    assert_eq!(body["exists"], false);
    let suggestions = body["suggestions"].as_array().unwrap();
    assert_eq!(suggestions.len(), 3);
    assert!(suggestions
        .iter()
        .all(|s| s["id"].as_str().unwrap().starts_with("AID-M-0")));

    let (_, _, body) = send(app(&h), get("/api/v1/ids/AID-M-001/suggestions")).await;
    assert_eq!(body["exists"], true);
    assert_eq!(body["well_formed"], true);
    assert!(body["suggestions"].as_array().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_threat_lookup() {
    let h = synced().await;

    let (status, _, body) = send(app(&h), get("/api/v1/threats/llm01")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["threat_id"], "LLM01");
    let defenses = body["defenses"].as_array().unwrap();
    assert_eq!(defenses.len(), 7);

    let (status, _, _) = send(app(&h), get("/api/v1/threats/LLM09")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stats_and_status() {
    let h = synced().await;

    let (status, _, body) = send(app(&h), get("/api/v1/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["content_version"], SHA_A);
    assert_eq!(body["document_count"], 480);

    let (status, _, body) = send(app(&h), get("/api/v1/status")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "ready");
    assert_eq!(body["content_version"], SHA_A);
    assert_eq!(body["document_count"], 480);
    assert_eq!(body["is_syncing"], false);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_trigger_sync() {
    let h = Harness::new();

    let (status, _, body) = send(app(&h), post_json("/api/v1/sync", json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");

    h.wait_for_version(SHA_A).await;
    let (status, _, _) = send(app(&h), get("/api/v1/documents/AID-R-066")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_security_headers_on_every_response() {
    let h = Harness::new();

    for request in [get("/health"), get("/api/v1/documents/AID-H-001"), get("/nope")] {
        let (_, headers, _) = send(app(&h), request).await;
        assert_eq!(headers[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(headers[header::X_FRAME_OPTIONS], "DENY");
        assert_eq!(headers[header::REFERRER_POLICY], "no-referrer");
        assert_eq!(headers[header::CACHE_CONTROL], "no-store");
        assert!(headers.contains_key(header::CONTENT_SECURITY_POLICY));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_sync_route_is_rate_limited() {
    let h = Harness::new();
    h.embedder.gate.arm();
    let app = app(&h);

    let (status, _, _) = send(app.clone(), post_json("/api/v1/sync", json!({}))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    h.embedder.gate.entered().await;
    for _ in 0..4 {
        let (status, _, _) = send(app.clone(), post_json("/api/v1/sync", json!({}))).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    let (status, headers, body) = send(app.clone(), post_json("/api/v1/sync", json!({}))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"]["code"], "rate_limited");
    let retry_after: u64 = headers[header::RETRY_AFTER].to_str().unwrap().parse().unwrap();
    assert!((1..=60).contains(&retry_after));

    // Other routes have their own, larger budget.
    let (status, _, _) = send(app.clone(), get("/health")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    h.embedder.gate.release();
    h.wait_for_version(SHA_A).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_query_route_limit_from_config() {
    let h = Harness::with_config(|config| config.server.rate_limit_per_minute = 2);
    assert!(h.service.orchestrator.run_sync().await);
    let app = app(&h);

    for _ in 0..2 {
        let (status, _, _) = send(app.clone(), get("/api/v1/stats")).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, headers, _) = send(app.clone(), get("/api/v1/stats")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.contains_key(header::RETRY_AFTER));

    let (status, _, _) = send(app.clone(), get("/api/v1/ids")).await;
    assert_eq!(status, StatusCode::OK);
}
