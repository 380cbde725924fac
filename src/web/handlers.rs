use axum::{
    extract::{Path, State},
    response::Json,
};
use serde::Deserialize;

use super::{ApiResponse, AppState, HealthCheck, HealthResponse, WebError};
use crate::control::{Reply, Requester};
use crate::models::TargetId;
use crate::proxy_pool::RouteStatus;
use crate::supervisor::TargetSnapshot;

#[derive(Debug, Deserialize)]
pub struct CommandRequest {
    pub text: String,
    /// Chat id to subscribe or attribute the command to. Defaults to "http".
    pub recipient: Option<String>,
    pub name: Option<String>,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let supervisor = &state.supervisor;
    let targets = supervisor.list().await;
    let enabled = targets.iter().filter(|t| t.enabled).count();
    let running = targets.iter().filter(|t| t.running).count();

    let upstream = match supervisor.health().failing_for().await {
        Some(failing) => HealthCheck::new(
            "upstream",
            false,
            Some(format!("failing for {}s", failing.as_secs())),
        ),
        None => HealthCheck::new("upstream", true, None),
    };
    let routes = match supervisor.pool().exhausted_for().await {
        Some(exhausted) => HealthCheck::new(
            "routes",
            false,
            Some(format!("all routes cooling down for {}s", exhausted.as_secs())),
        ),
        None => HealthCheck::new("routes", true, None),
    };
    let monitors = HealthCheck::new(
        "monitors",
        supervisor.global_policy().paused || running == enabled,
        Some(format!("{} of {} enabled target(s) running", running, enabled)),
    );

    Json(HealthResponse::from_checks(
        state.started_at.elapsed().as_secs(),
        vec![upstream, routes, monitors],
    ))
}

/// GET /api/v1/targets
pub async fn list_targets(State(state): State<AppState>) -> Json<ApiResponse<Vec<TargetSnapshot>>> {
    Json(ApiResponse::success(state.supervisor.list().await))
}

/// GET /api/v1/targets/:product/:location
pub async fn get_target(
    State(state): State<AppState>,
    Path((product, location)): Path<(String, String)>,
) -> Result<Json<ApiResponse<TargetSnapshot>>, WebError> {
    let id = TargetId::new(product, location);
    state
        .supervisor
        .list()
        .await
        .into_iter()
        .find(|t| t.id == id)
        .map(|snapshot| Json(ApiResponse::success(snapshot)))
        .ok_or_else(|| WebError::not_found(format!("target {}", id)))
}

/// GET /api/v1/routes
pub async fn list_routes(State(state): State<AppState>) -> Json<ApiResponse<Vec<RouteStatus>>> {
    Json(ApiResponse::success(state.supervisor.pool().snapshot().await))
}

/// POST /api/v1/commands
pub async fn run_command(
    State(state): State<AppState>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<ApiResponse<Reply>>, WebError> {
    if request.text.trim().is_empty() {
        return Err(WebError::bad_request("Command text is required"));
    }

    let recipient = request
        .recipient
        .filter(|r| !r.trim().is_empty())
        .unwrap_or_else(|| "http".to_string());
    let requester = Requester::new(recipient, request.name);

    tracing::info!(recipient = %requester.recipient, "Command received over HTTP: {}", request.text);
    let reply = state.control.handle(&requester, &request.text).await;
    if reply.is_error {
        return Err(WebError::unprocessable(reply.text));
    }
    Ok(Json(ApiResponse::success(reply)))
}
