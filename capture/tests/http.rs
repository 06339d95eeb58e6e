use std::time::Duration;

use anyhow::Result;
use assert_json_diff::{assert_json_eq, assert_json_include};
use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use capture::config::PipelineSettings;
use capture::health::HealthRegistry;
use capture::router::router;
use capture::store::MemoryBackend;

use crate::common::*;
mod common;

async fn started_app() -> (TestPipeline, Router) {
    let test = TestPipeline::started(PipelineSettings::default()).await;
    let app = router(test.pipeline.clone(), HealthRegistry::new("liveness"), false);
    (test, app)
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .expect("valid request");

    let response = app.clone().oneshot(request).await.expect("infallible");
    let status = response.status();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("readable body")
        .to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test(start_paused = true)]
async fn it_captures_and_lists_events() -> Result<()> {
    let (test, app) = started_app().await;

    let (status, body) = call(
        &app,
        Method::POST,
        "/events",
        Some(json!({
            "id": "msg-1",
            "type": "message",
            "timestamp": "2024-03-20T11:59:00Z",
            "source": "network",
            "data": {"body": "hello"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(body, json!({"accepted": 1, "duplicates": 0, "ids": ["msg-1"]}));

    let (status, body) = call(&app, Method::POST, "/flush", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["committed"], json!(1));

    let (status, body) = call(&app, Method::GET, "/records", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(
        body,
        json!([{
            "id": "msg-1",
            "kind": "message",
            "occurredAt": "2024-03-20T11:59:00Z",
            "source": "network",
            "payload": {"body": "hello"}
        }])
    );

    let (status, body) = call(&app, Method::GET, "/entries", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));
    assert_json_include!(actual: body[0], expected: json!({"inserted_at": "2024-03-20T12:00:00Z"}));

    test.pipeline.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn it_reports_duplicates_and_generates_ids() -> Result<()> {
    let (test, app) = started_app().await;

    let (_, body) = call(
        &app,
        Method::POST,
        "/events",
        Some(json!([{"id": "a", "kind": "message"}, {"kind": "presence"}])),
    )
    .await;
    assert_eq!(body["accepted"], json!(2));
    let generated = body["ids"][1].as_str().expect("generated id").to_string();
    assert!(!generated.is_empty());

    let (status, body) = call(
        &app,
        Method::POST,
        "/events",
        Some(json!({"id": "a", "kind": "message"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(body, json!({"accepted": 0, "duplicates": 1, "ids": []}));

    test.pipeline.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn it_rejects_bad_event_requests() -> Result<()> {
    let (test, app) = started_app().await;

    let (status, _) = call(&app, Method::POST, "/events", Some(json!([]))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = call(&app, Method::POST, "/events", Some(json!({"kind": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, Method::POST, "/events", Some(json!({"id": 3}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some());

    test.pipeline.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn throttled_events_default_to_dom() -> Result<()> {
    let (test, app) = started_app().await;

    let (status, _) = call(
        &app,
        Method::POST,
        "/events/throttled",
        Some(json!({"id": "node-1", "kind": "contact"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    test.pipeline.stop().await?;
    let records = test.pipeline.list_records().await?;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].source.as_str(), "dom");
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn config_is_read_and_merged() -> Result<()> {
    let (test, app) = started_app().await;

    let (status, body) = call(&app, Method::GET, "/config", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(
        body,
        json!({
            "batchSize": 20,
            "flushIntervalMs": 2000,
            "capacity": 1000,
            "retentionMs": 604800000u64
        })
    );

    let (status, body) = call(
        &app,
        Method::PATCH,
        "/config",
        Some(json!({"retentionMs": 3600000})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(
        body,
        json!({
            "batchSize": 20,
            "flushIntervalMs": 2000,
            "capacity": 1000,
            "retentionMs": 3600000
        })
    );

    let (status, body) = call(&app, Method::PATCH, "/config", Some(json!({"batchSize": 0}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], json!("batchSize must be greater than zero"));
    assert_eq!(test.pipeline.get_config().batch_size, 20);

    test.pipeline.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn entries_can_be_ranged_and_cleared() -> Result<()> {
    let (test, app) = started_app().await;

    test.pipeline.submit_event(records("range", 3))?;
    test.pipeline.flush().await?;

    let (status, body) = call(
        &app,
        Method::GET,
        "/entries?from=2024-03-20T12:00:00Z&to=2024-03-20T12:00:01Z",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(3));

    let (status, body) = call(&app, Method::GET, "/entries?to=2024-03-20T11:00:00Z", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = call(&app, Method::GET, "/entries?from=yesterday", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&app, Method::DELETE, "/entries", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_json_eq!(body, json!({"removed": 3}));

    let (_, body) = call(&app, Method::GET, "/stats", None).await;
    assert_json_include!(
        actual: body,
        expected: json!({"status": "active", "stored": 0, "seenIds": 0, "pending": 0})
    );

    test.pipeline.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sweep_runs_on_demand() -> Result<()> {
    let (test, app) = started_app().await;

    let (status, body) = call(&app, Method::POST, "/sweep", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_json_include!(
        actual: body,
        expected: json!({"skipped": false, "report": {"expired": 0, "corrupt": 0}})
    );

    test.pipeline.stop().await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stopped_pipeline_is_unavailable() -> Result<()> {
    let (test, app) = started_app().await;
    test.pipeline.stop().await?;

    let (status, _) = call(&app, Method::POST, "/events", Some(json!({"kind": "message"}))).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = call(&app, Method::POST, "/flush", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    let (status, _) = call(&app, Method::GET, "/_readiness", None).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

    // Reads keep working
    let (status, _) = call(&app, Method::GET, "/config", None).await;
    assert_eq!(status, StatusCode::OK);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn liveness_follows_background_tasks() -> Result<()> {
    let liveness = HealthRegistry::new("liveness");
    let test = TestPipeline::build(
        PipelineSettings::default(),
        MemoryBackend::new(),
        Some(liveness.clone()),
    )
    .await;
    let app = router(test.pipeline.clone(), liveness, false);

    let (status, _) = call(&app, Method::GET, "/_liveness", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    test.pipeline.start().await?;
    tokio::time::sleep(Duration::from_millis(10)).await;

    let (status, _) = call(&app, Method::GET, "/_liveness", None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, Method::GET, "/_readiness", None).await;
    assert_eq!(status, StatusCode::OK);

    test.pipeline.stop().await?;
    Ok(())
}
