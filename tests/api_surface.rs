//! HTTP surface tests against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use tower::ServiceExt;

use phoenix::api::{ApiState, router};
use phoenix::bus::EventBus;
use phoenix::config::{AnalyzerConfig, DispatchConfig, EngineConfig, HubConfig, QueueConfig};
use phoenix::dispatch::AgentDispatcher;
use phoenix::experiment::{ExperimentEngine, NullMetricSource, TemplateDirRenderer};
use phoenix::hub::RealtimeHub;
use phoenix::queue::{HostSignals, TaskQueue};
use phoenix::store::{MemoryStore, Store};

fn test_router() -> Router {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let bus = Arc::new(EventBus::default());
    let signals = Arc::new(HostSignals::new());
    let queue = Arc::new(TaskQueue::new(
        Arc::clone(&store),
        Arc::clone(&bus),
        Arc::clone(&signals),
        &QueueConfig {
            lease_duration: Duration::from_secs(300),
            max_attempts: 3,
            backoff_base: Duration::from_secs(10),
            backoff_cap: Duration::from_secs(300),
            reaper_interval: Duration::from_secs(30),
        },
    ));
    let dispatcher = Arc::new(AgentDispatcher::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&bus),
        signals,
        DispatchConfig {
            heartbeat_healthy_window: Duration::from_secs(60),
            offline_threshold: Duration::from_secs(300),
            long_poll_default: Duration::from_secs(30),
            long_poll_max: Duration::from_secs(120),
        },
    ));
    let metrics = Arc::new(NullMetricSource);
    let engine = Arc::new(ExperimentEngine::new(
        Arc::clone(&store),
        Arc::clone(&queue),
        Arc::clone(&bus),
        Arc::new(TemplateDirRenderer::new("templates")),
        metrics.clone(),
        EngineConfig {
            collect_interval: Duration::from_secs(10),
            max_experiment_duration: Duration::from_secs(604_800),
            template_dir: "templates".into(),
        },
        &AnalyzerConfig {
            min_sample: 30,
            alpha: 0.05,
        },
        "http://localhost:9091".to_string(),
    ));
    let hub = Arc::new(RealtimeHub::new(
        Arc::clone(&bus),
        HubConfig {
            client_buffer: 100,
            pong_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        },
    ));

    router(Arc::new(ApiState {
        engine,
        dispatcher,
        queue,
        hub,
        store,
        metrics,
        agent_token: None,
    }))
}

fn experiment_body() -> serde_json::Value {
    serde_json::json!({
        "name": "topk-rollout",
        "baseline_pipeline": "process-baseline-v1",
        "candidate_pipeline": "process-topk-v1",
        "target_hosts": ["h1", "h2"],
        "config": {
            "duration_secs": 60,
            "metrics": ["cardinality"]
        }
    })
}

async fn send(router: &Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn post(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn health_endpoint_answers() {
    let router = test_router();
    let (status, body) = send(&router, get("/api/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn experiment_crud_round_trip() {
    let router = test_router();

    let (status, created) = send(&router, post("/api/v1/experiments", &experiment_body())).await;
    assert_eq!(status, StatusCode::CREATED, "{created}");
    assert_eq!(created["state"], "pending");
    let id = created["id"].as_str().unwrap().to_string();

    let (status, fetched) = send(&router, get(&format!("/api/v1/experiments/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(fetched["name"], "topk-rollout");

    // No results yet.
    let (status, _) = send(&router, get(&format!("/api/v1/experiments/{id}/results"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Promotion before completion is a conflict.
    let (status, body) = send(
        &router,
        post(&format!("/api/v1/experiments/{id}/promote"), &serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "conflict");
    assert_eq!(body["error"]["message"], "experiment not completed");
}

#[tokio::test]
async fn invalid_experiment_reports_field_errors() {
    let router = test_router();
    let mut body = experiment_body();
    body["candidate_pipeline"] = body["baseline_pipeline"].clone();

    let (status, response) = send(&router, post("/api/v1/experiments", &body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"]["kind"], "validation");
    assert!(
        response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("candidate_pipeline")
    );
}

#[tokio::test]
async fn unknown_experiment_is_404() {
    let router = test_router();
    let (status, body) = send(
        &router,
        get("/api/v1/experiments/00000000-0000-0000-0000-000000000000"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "not-found");
}

#[tokio::test]
async fn agent_heartbeat_then_zero_wait_poll() {
    let router = test_router();

    let heartbeat = Request::builder()
        .method("POST")
        .uri("/agent/heartbeat")
        .header("content-type", "application/json")
        .header("x-agent-host-id", "h1")
        .body(Body::from(
            serde_json::json!({"hostname": "node-1", "version": "1.0.0"}).to_string(),
        ))
        .unwrap();
    let (status, ack) = send(&router, heartbeat).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["assigned_id"], "h1");
    assert_eq!(ack["status"], "healthy");

    let poll = Request::builder()
        .uri("/agent/tasks?max=5&wait=0")
        .header("x-agent-host-id", "h1")
        .body(Body::empty())
        .unwrap();
    let (status, tasks) = send(&router, poll).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(tasks, serde_json::json!([]));
}

#[tokio::test]
async fn agent_requests_require_the_host_header() {
    let router = test_router();
    let (status, body) = send(&router, get("/agent/tasks?wait=0")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "unauthenticated");
}

#[tokio::test]
async fn unknown_host_poll_is_unauthenticated() {
    let router = test_router();
    let poll = Request::builder()
        .uri("/agent/tasks?wait=0")
        .header("x-agent-host-id", "never-heartbeated")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&router, poll).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"]["kind"], "unauthenticated");
}

#[tokio::test]
async fn deployment_uniqueness_surfaces_as_conflict() {
    let router = test_router();
    let body = serde_json::json!({
        "deployment_name": "edge",
        "namespace": "default",
        "pipeline": "process-baseline-v1"
    });

    let (status, _) = send(&router, post("/api/v1/pipeline-deployments", &body)).await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, response) = send(&router, post("/api/v1/pipeline-deployments", &body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(response["error"]["kind"], "conflict");
}

#[tokio::test]
async fn cost_flow_returns_a_snapshot() {
    let router = test_router();
    let (status, body) = send(&router, get("/api/v1/cost-flow")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_cost_per_minute"], 0.0);
}
