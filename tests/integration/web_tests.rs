use axum::{
    body::{to_bytes, Body},
    http::{header, Method, Request, StatusCode},
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use super::*;
use shelf_scout::store::MemoryStore;
use shelf_scout::web::{create_router, AppState};

async fn call(app: &axum::Router, request: Request<Body>) -> anyhow::Result<(StatusCode, Value)> {
    let response = app.clone().oneshot(request).await?;
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await?;
    Ok((status, serde_json::from_slice(&bytes)?))
}

fn command(text: &str, recipient: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/api/v1/commands")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "text": text, "recipient": recipient }).to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_http_commands_and_target_listing() -> anyhow::Result<()> {
    let harness = HarnessBuilder::new(Arc::new(MemoryStore::new()), ScriptedFetcher::states(&[A]))
        .build()
        .await?;
    let app = create_router(AppState::new(harness.control.clone(), harness.supervisor.clone()));

    let (status, body) = call(&app, command("/add MU793LL/A R409 iPhone 15 Pro", "1001")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);

    let (status, _) = call(&app, command("/subscribe all", "1001")).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(harness.subscribers.get("1001").await.is_some());

    let (status, body) = call(&app, get("/api/v1/targets")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["data"][0]["enabled"], true);

    let (status, body) = call(&app, get("/api/v1/targets/MU793LL%2FA/R409")).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["display_name"], "iPhone 15 Pro");

    let (status, body) = call(&app, command("/remove NOPE R1", "1001")).await?;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"]["code"], "UNPROCESSABLE_ENTITY");

    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_health_reports_paused_monitoring_as_healthy() -> anyhow::Result<()> {
    let harness = HarnessBuilder::new(Arc::new(MemoryStore::new()), ScriptedFetcher::states(&[U]))
        .build()
        .await?;
    let app = create_router(AppState::new(harness.control.clone(), harness.supervisor.clone()));

    call(&app, command("/pause", "ops")).await?;
    let (status, body) = call(&app, get("/health")).await?;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");

    harness.stop().await;
    Ok(())
}
