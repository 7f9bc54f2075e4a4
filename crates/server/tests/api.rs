use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use db::DBService;
use http_body_util::BodyExt;
use serde_json::{Value, json};
use server::{AppState, routes};
use services::services::{
    agent::EchoAgent, broker::BrokerManager, config::Config, execution::ExecutionEngine,
    streaming::StreamingService,
};
use tower::ServiceExt;
use uuid::Uuid;

async fn test_app() -> Router {
    let db = DBService::new_in_memory().await.expect("in-memory db");
    let config = Arc::new(Config {
        join_poll_interval_ms: 20,
        join_timeout_secs: 5,
        ..Config::default()
    });
    let brokers = Arc::new(BrokerManager::new(config.broker_capacity));
    let engine = ExecutionEngine::new(
        db.clone(),
        brokers.clone(),
        Arc::new(EchoAgent),
        config.clone(),
    );
    let streaming = StreamingService::new(db.clone(), brokers);
    routes::router(AppState::new(db, engine, streaming, config))
}

fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn create_thread(app: &Router) -> Uuid {
    let response = app
        .clone()
        .oneshot(json_request("POST", "/threads", json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["success"], json!(true));
    body["data"]["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn health_check_responds() {
    let app = test_app().await;
    let response = app.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"], json!("OK"));
}

#[tokio::test]
async fn thread_lifecycle() {
    let app = test_app().await;
    let thread_id = create_thread(&app).await;

    let response = app
        .clone()
        .oneshot(get_request(&format!("/threads/{thread_id}")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["status"], json!("idle"));

    let response = app
        .oneshot(get_request(&format!("/threads/{}", Uuid::new_v4())))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn run_executes_and_join_returns_output() {
    let app = test_app().await;
    let thread_id = create_thread(&app).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/threads/{thread_id}/runs"),
            json!({"input": {"message": "hello"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let run_id = body["data"]["id"].as_str().unwrap().to_string();

    // the echo executor finishes quickly; join blocks until terminal
    let response = app
        .clone()
        .oneshot(get_request(&format!(
            "/threads/{thread_id}/runs/{run_id}/join"
        )))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body, json!({"message": "hello"}));

    let response = app
        .clone()
        .oneshot(get_request(&format!("/threads/{thread_id}/runs/{run_id}")))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["data"]["status"], json!("success"));

    // listing with a status filter only returns matching runs
    let response = app
        .oneshot(get_request(&format!(
            "/threads/{thread_id}/runs?status=success"
        )))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn streaming_create_emits_sse_wire_format() {
    let app = test_app().await;
    let thread_id = create_thread(&app).await;

    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/threads/{thread_id}/runs/stream"),
            json!({"input": {"message": "hi"}, "stream_mode": ["values"]}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/event-stream"
    );
    assert_eq!(
        response.headers().get(header::CACHE_CONTROL).unwrap(),
        "no-cache"
    );
    let location = response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(location.starts_with(&format!("/threads/{thread_id}/runs/")));

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let wire = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(wire.contains("event: metadata\n"));
    assert!(wire.contains("event: values\n"));
    assert!(wire.contains("data: {\"message\":\"hi\"}\n\n"));
    assert!(wire.trim_end().ends_with("data: {\"status\":\"success\"}"));
}

#[tokio::test]
async fn reconnect_resumes_after_last_event_id() {
    let app = test_app().await;
    let thread_id = create_thread(&app).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/threads/{thread_id}/runs"),
            json!({"input": {"n": 1}}),
        ))
        .await
        .unwrap();
    let body = json_body(response).await;
    let run_id = body["data"]["id"].as_str().unwrap().to_string();

    app.clone()
        .oneshot(get_request(&format!(
            "/threads/{thread_id}/runs/{run_id}/join"
        )))
        .await
        .unwrap();

    // log is metadata(0), values(1), end(2); resume after metadata
    let request = Request::builder()
        .uri(format!("/threads/{thread_id}/runs/{run_id}/stream"))
        .header("Last-Event-ID", format!("{run_id}_event_0"))
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let wire = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(!wire.contains("event: metadata\n"));
    assert!(!wire.contains(&format!("id: {run_id}_event_0\n")));
    assert!(wire.contains(&format!("id: {run_id}_event_1\n")));
    assert!(wire.contains("event: end\n"));
}

#[tokio::test]
async fn request_validation() {
    let app = test_app().await;
    let thread_id = create_thread(&app).await;
    let runs_uri = format!("/threads/{thread_id}/runs");

    // input is required
    let response = app
        .clone()
        .oneshot(json_request("POST", &runs_uri, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // config and context are mutually exclusive
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &runs_uri,
            json!({"input": {}, "config": {"a": 1}, "context": {"b": 2}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // unknown stream mode
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &runs_uri,
            json!({"input": {}, "stream_mode": "telepathy"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["success"], json!(false));

    // unknown thread is a 404
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/threads/{}/runs", Uuid::new_v4()),
            json!({"input": {}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn status_update_only_accepts_interrupted() {
    let app = test_app().await;
    let thread_id = create_thread(&app).await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/threads/{thread_id}/runs"),
            json!({"input": {"x": 1}}),
        ))
        .await
        .unwrap();
    let body = json_body(response).await;
    let run_id = body["data"]["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/threads/{thread_id}/runs/{run_id}"),
            json!({"status": "success"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // interrupting an already-finished run reports its terminal status
    app.clone()
        .oneshot(get_request(&format!(
            "/threads/{thread_id}/runs/{run_id}/join"
        )))
        .await
        .unwrap();
    let response = app
        .oneshot(json_request(
            "POST",
            &format!("/threads/{thread_id}/runs/{run_id}"),
            json!({"status": "interrupted"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["data"]["status"], json!("success"));
}
