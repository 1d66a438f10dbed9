use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use config_rs::{GatewayConfig, QueryMethod, ServiceEntry};
use futures_util::StreamExt;
use query_gateway::models::{HealthState, HealthStatus};
use query_gateway::QueryGateway;
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn entry(name: &str, domain: &str, base_url: &str, tags: &[&str], timeout_ms: u64) -> ServiceEntry {
    ServiceEntry {
        name: name.to_string(),
        domain: domain.to_string(),
        base_url: base_url.to_string(),
        capability_tags: tags.iter().map(|t| t.to_string()).collect(),
        health_path: "/health".to_string(),
        query_path: "/query".to_string(),
        query_method: QueryMethod::Post,
        timeout_ms: Some(timeout_ms),
    }
}

async fn domain_service(delay: Duration, body: Value) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .respond_with(ResponseTemplate::new(200).set_delay(delay).set_body_json(body))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "healthy"})))
        .mount(&server)
        .await;
    server
}

fn gateway(services: Vec<ServiceEntry>) -> Arc<QueryGateway> {
    let config = GatewayConfig {
        services,
        ..GatewayConfig::default()
    };
    Arc::new(QueryGateway::from_config(config).unwrap())
}

fn app(gateway: &Arc<QueryGateway>) -> Router {
    gateway.clone().create_router()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// `data:` payloads of an SSE body, in order
async fn sse_events(response: axum::response::Response) -> Vec<Value> {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec())
        .unwrap()
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim_start()).unwrap())
        .collect()
}

fn statuses(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|e| e["status"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn single_healthy_service_completes() {
    let genomics = domain_service(
        Duration::from_millis(50),
        json!({"summary": "BRCA1 is a tumor suppressor gene"}),
    )
    .await;
    let gateway = gateway(vec![entry("genomics", "genomics", &genomics.uri(), &["gene"], 2000)]);

    let response = app(&gateway)
        .oneshot(post_json("/chat/alice", json!({"message": "What does BRCA1 do?"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["overall_status"], "complete");
    assert_eq!(body["user_id"], "alice");
    assert_eq!(body["outcomes"].as_array().unwrap().len(), 1);
    assert_eq!(body["outcomes"][0]["status"], "success");
    assert_eq!(body["outcomes"][0]["payload"]["domain"], "genomics");
    assert_eq!(
        body["synthesized_summary"],
        "[Genomics] BRCA1 is a tumor suppressor gene"
    );
}

#[tokio::test]
async fn single_service_stream_emits_full_sequence() {
    let genomics = domain_service(Duration::from_millis(50), json!({"summary": "ok"})).await;
    let gateway = gateway(vec![entry("genomics", "genomics", &genomics.uri(), &["gene"], 2000)]);

    let response = app(&gateway)
        .oneshot(post_json("/chat/alice/stream", json!({"message": "BRCA1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let events = sse_events(response).await;
    assert_eq!(
        statuses(&events),
        vec!["queued", "dispatching", "service_completed", "synthesizing", "done"]
    );

    let sequence: Vec<u64> = events
        .iter()
        .map(|e| e["sequence_number"].as_u64().unwrap())
        .collect();
    assert_eq!(sequence, vec![1, 2, 3, 4, 5]);
    assert_eq!(events[2]["service"], "genomics");
    assert_eq!(events[4]["result"]["overall_status"], "complete");
    assert!(events[..4].iter().all(|e| e.get("result").is_none()));
}

#[tokio::test]
async fn timeout_and_success_give_partial_in_plan_order() {
    let genomics = domain_service(Duration::from_secs(5), json!({"summary": "too late"})).await;
    let literature = domain_service(Duration::from_millis(200), json!({"synthesis": "12 papers"})).await;
    let gateway = gateway(vec![
        entry("genomics", "genomics", &genomics.uri(), &["gene"], 300),
        entry("literature", "literature", &literature.uri(), &["literature"], 1000),
    ]);

    let started = Instant::now();
    let response = app(&gateway)
        .oneshot(post_json(
            "/chat/alice",
            json!({"message": "tell me everything", "tags": ["gene", "literature"]}),
        ))
        .await
        .unwrap();
    let elapsed = started.elapsed();

    let body = body_json(response).await;
    assert_eq!(body["overall_status"], "partial");
    assert_eq!(body["outcomes"][0]["service_name"], "genomics");
    assert_eq!(body["outcomes"][0]["status"], "timeout");
    assert_eq!(body["outcomes"][1]["service_name"], "literature");
    assert_eq!(body["outcomes"][1]["status"], "success");
    assert_eq!(body["failed_services"], json!(["genomics"]));
    assert!(elapsed >= Duration::from_millis(300), "batch returned early after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(2), "batch took {:?}", elapsed);
}

#[tokio::test]
async fn unreachable_only_match_is_skipped() {
    let genomics = domain_service(Duration::ZERO, json!({"summary": "unused"})).await;
    let gateway = gateway(vec![entry("genomics", "genomics", &genomics.uri(), &["gene"], 2000)]);
    gateway.health_table().set(HealthStatus {
        service_name: "genomics".to_string(),
        state: HealthState::Unreachable,
        last_checked_at: None,
        consecutive_failures: 3,
    });

    let response = app(&gateway)
        .oneshot(post_json("/chat/alice", json!({"message": "BRCA1 variants"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["overall_status"], "failed");
    assert_eq!(body["skipped_services"], json!(["genomics"]));
    assert_eq!(body["outcomes"][0]["status"], "skipped_unhealthy");
    assert!(genomics
        .received_requests()
        .await
        .unwrap()
        .iter()
        .all(|r| r.url.path() != "/query"));
}

#[tokio::test]
async fn unmatched_query_is_no_route() {
    let genomics = domain_service(Duration::ZERO, json!({})).await;
    let gateway = gateway(vec![entry("genomics", "genomics", &genomics.uri(), &["gene"], 2000)]);

    let response = app(&gateway)
        .oneshot(post_json("/chat/alice", json!({"message": "good morning"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "NO_ROUTE");
    assert_eq!(body["code"], 422);

    let response = app(&gateway)
        .oneshot(post_json("/chat/alice/stream", json!({"message": "good morning"})))
        .await
        .unwrap();
    let events = sse_events(response).await;
    assert_eq!(statuses(&events), vec!["queued", "error"]);
}

#[tokio::test]
async fn stream_disconnect_still_records_turn() {
    let genomics = domain_service(Duration::from_millis(300), json!({"summary": "late answer"})).await;
    let gateway = gateway(vec![entry("genomics", "genomics", &genomics.uri(), &["gene"], 2000)]);

    let response = app(&gateway)
        .oneshot(post_json(
            "/chat/alice/stream",
            json!({"message": "BRCA1 function", "conversation_id": "c-disconnect"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut frames = response.into_body().into_data_stream();
    let first = frames.next().await.unwrap().unwrap();
    assert!(String::from_utf8_lossy(&first).contains("queued"));
    drop(frames);

    let mut turns = Vec::new();
    for _ in 0..30 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let response = app(&gateway)
            .oneshot(
                Request::builder()
                    .uri("/chat/alice/history?conversation_id=c-disconnect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        turns = body_json(response).await["turns"].as_array().unwrap().clone();
        if !turns.is_empty() {
            break;
        }
    }

    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0]["query"], "BRCA1 function");
    assert_eq!(turns[0]["overall_status"], "complete");
    assert_eq!(turns[0]["summary"], "[Genomics] late answer");
}

#[tokio::test]
async fn identical_requests_give_identical_results() {
    let genomics = domain_service(Duration::ZERO, json!({"interpretation": "benign"})).await;
    let gateway = gateway(vec![entry("genomics", "genomics", &genomics.uri(), &["gene"], 2000)]);

    let mut results = Vec::new();
    for _ in 0..2 {
        let response = app(&gateway)
            .oneshot(post_json("/chat/alice", json!({"message": "BRCA1"})))
            .await
            .unwrap();
        let mut body = body_json(response).await;
        for volatile in ["query_id", "conversation_id", "timestamp"] {
            body.as_object_mut().unwrap().remove(volatile);
        }
        for outcome in body["outcomes"].as_array_mut().unwrap() {
            outcome.as_object_mut().unwrap().remove("elapsed_ms");
        }
        results.push(body);
    }

    assert_eq!(results[0], results[1]);
}

#[tokio::test]
async fn conversation_history_and_ownership() {
    let genomics = domain_service(Duration::ZERO, json!({"summary": "ok"})).await;
    let gateway = gateway(vec![entry("genomics", "genomics", &genomics.uri(), &["gene"], 2000)]);

    let response = app(&gateway)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/chat/alice/new-conversation")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let conversation_id = body_json(response).await["conversation_id"]
        .as_str()
        .unwrap()
        .to_string();

    for message in ["BRCA1 function", "and its risks?"] {
        let response = app(&gateway)
            .oneshot(post_json(
                "/chat/alice",
                json!({"message": message, "conversation_id": conversation_id}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app(&gateway)
        .oneshot(
            Request::builder()
                .uri(format!("/chat/alice/history?conversation_id={}", conversation_id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let history = body_json(response).await;
    let queries: Vec<&str> = history["turns"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["query"].as_str().unwrap())
        .collect();
    assert_eq!(queries, vec!["BRCA1 function", "and its risks?"]);

    let response = app(&gateway)
        .oneshot(post_json(
            "/chat/mallory",
            json!({"message": "BRCA1", "conversation_id": conversation_id}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["kind"], "CONVERSATION_FORBIDDEN");
}

#[tokio::test]
async fn malformed_requests_rejected_before_planning() {
    let genomics = domain_service(Duration::ZERO, json!({})).await;
    let gateway = gateway(vec![entry("genomics", "genomics", &genomics.uri(), &["gene"], 2000)]);

    let response = app(&gateway)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/chat/alice")
                .header("content-type", "text/plain")
                .body(Body::from("BRCA1"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let response = app(&gateway)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/chat/alice")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["kind"], "INVALID_FORMAT");

    let response = app(&gateway)
        .oneshot(post_json("/chat/alice", json!({"message": "BRCA1", "extra": true})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["kind"], "SCHEMA_VIOLATION");

    let response = app(&gateway)
        .oneshot(post_json("/chat/bad%20user", json!({"message": "BRCA1"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let oversized = json!({"message": "x".repeat(70 * 1024)});
    let response = app(&gateway)
        .oneshot(post_json("/chat/alice", oversized))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "PAYLOAD_TOO_LARGE");
    assert_eq!(body["code"], 413);

    let response = app(&gateway)
        .oneshot(Request::builder().uri("/chat/alice/history").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["kind"], "INVALID_FORMAT");
    assert_eq!(body["code"], 400);

    assert!(genomics.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn health_and_catalog_reflect_probes() {
    let up = domain_service(Duration::ZERO, json!({})).await;
    let gateway = gateway(vec![
        entry("genomics", "genomics", &up.uri(), &["gene"], 2000),
        entry("literature", "literature", "http://127.0.0.1:9", &["literature"], 2000),
    ]);
    gateway.prober().probe_all().await;

    let response = app(&gateway)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let health = body_json(response).await;
    assert_eq!(health["status"], "DEGRADED");
    assert_eq!(health["healthy_services"], 1);
    assert_eq!(health["total_services"], 2);
    assert_eq!(health["services"][1]["state"], "unreachable");

    let response = app(&gateway)
        .oneshot(Request::builder().uri("/services").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let catalog = body_json(response).await;
    assert_eq!(catalog[0]["name"], "genomics");
    assert_eq!(catalog[0]["health"]["state"], "healthy");
    assert_eq!(catalog[0]["capability_tags"], json!(["gene"]));
    assert_eq!(catalog[1]["declared_timeout_ms"], 2000);
}

#[tokio::test]
async fn registry_reload_swaps_services() {
    let file = std::env::temp_dir().join(format!("gateway-reload-{}.toml", uuid::Uuid::new_v4()));
    std::fs::write(
        &file,
        r#"
[[service]]
name = "literature"
domain = "literature"
base_url = "http://127.0.0.1:9"
capability_tags = ["literature"]

[[service]]
name = "metabolics"
domain = "metabolics"
base_url = "http://127.0.0.1:9"
capability_tags = ["drug"]
"#,
    )
    .unwrap();

    let config = GatewayConfig {
        services: vec![
            entry("genomics", "genomics", "http://127.0.0.1:9", &["gene"], 2000),
            entry("literature", "literature", "http://127.0.0.1:9", &["literature"], 2000),
        ],
        ..GatewayConfig::default()
    };
    let gateway = Arc::new(QueryGateway::from_config(config).unwrap().with_config_path(&file));
    gateway.health_table().record("literature", true);

    let response = app(&gateway)
        .oneshot(Request::builder().method("POST").uri("/registry/reload").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["services"], json!(["literature", "metabolics"]));
    assert_eq!(body["added"], json!(["metabolics"]));
    assert_eq!(body["removed"], json!(["genomics"]));

    let table = gateway.health_table();
    assert_eq!(table.current_status("literature").state, HealthState::Healthy);
    assert_eq!(table.current_status("metabolics").state, HealthState::Unknown);
    assert!(!table.snapshot().contains_key("genomics"));

    std::fs::remove_file(&file).ok();
}

#[tokio::test]
async fn registry_reload_rejects_broken_file() {
    let file = std::env::temp_dir().join(format!("gateway-reload-{}.toml", uuid::Uuid::new_v4()));
    std::fs::write(&file, "[[service]\nname = ").unwrap();

    let genomics = entry("genomics", "genomics", "http://127.0.0.1:9", &["gene"], 2000);
    let config = GatewayConfig {
        services: vec![genomics],
        ..GatewayConfig::default()
    };
    let gateway = Arc::new(QueryGateway::from_config(config).unwrap().with_config_path(&file));

    let err = gateway.reload_registry().await.unwrap_err();
    assert_eq!(err.kind(), "CONFIGURATION");
    assert_eq!(gateway.registry().snapshot().names(), vec!["genomics".to_string()]);

    let response = app(&gateway)
        .oneshot(Request::builder().method("POST").uri("/registry/reload").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body_json(response).await["kind"], "CONFIGURATION");

    std::fs::remove_file(&file).ok();
}
