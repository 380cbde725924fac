use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tower::ServiceBuilder;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::config::ServerConfig;
use crate::control::ControlChannel;
use crate::supervisor::MonitorSupervisor;

pub mod handlers;
pub mod responses;

pub use handlers::{get_target, health_check, list_routes, list_targets, run_command};
pub use responses::*;

#[derive(Clone)]
pub struct AppState {
    pub control: Arc<ControlChannel>,
    pub supervisor: Arc<MonitorSupervisor>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(control: Arc<ControlChannel>, supervisor: Arc<MonitorSupervisor>) -> Self {
        Self {
            control,
            supervisor,
            started_at: Instant::now(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .nest("/api/v1", api_routes())
        .layer(
            ServiceBuilder::new().layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                    .on_response(DefaultOnResponse::new().level(Level::INFO)),
            ),
        )
        .with_state(state)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/targets", get(list_targets))
        .route("/targets/:product/:location", get(get_target))
        .route("/routes", get(list_routes))
        .route("/commands", post(run_command))
}

pub async fn serve(config: &ServerConfig, state: AppState, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;

    tracing::info!("Control API listening on {}:{}", config.host, config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::Fetcher;
    use crate::models::{AvailabilityState, FetchResult, Observation, Target};
    use crate::monitor::MonitorSettings;
    use crate::notifications::SubscriberRegistry;
    use crate::proxy_pool::{PoolSettings, ProxyPool, ProxyRoute};
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request, StatusCode},
    };
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    struct AvailableFetcher;

    #[async_trait]
    impl Fetcher for AvailableFetcher {
        async fn fetch(&self, _target: &Target, _route: &ProxyRoute) -> FetchResult {
            Ok(Observation::now(AvailabilityState::Available))
        }
    }

    async fn test_state() -> AppState {
        let store = Arc::new(MemoryStore::new());
        let settings = MonitorSettings {
            interval: Duration::from_secs(60),
            jitter: 0.0,
            failure_threshold: 3,
            max_backoff_multiplier: 8,
            max_delay: Duration::from_secs(600),
        };
        let (supervisor, _rx) = MonitorSupervisor::new(
            Arc::new(AvailableFetcher),
            Arc::new(ProxyPool::new(vec![], PoolSettings::default())),
            store.clone(),
            settings,
            16,
        );
        let supervisor = Arc::new(supervisor);
        let subscribers = Arc::new(SubscriberRegistry::load(store, vec![]).await.unwrap());
        let control = Arc::new(ControlChannel::new(supervisor.clone(), subscribers));
        AppState::new(control, supervisor)
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn command(text: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/v1/commands")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "text": text }).to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(test_state().await);

        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["checks"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_command_then_list_targets() {
        let state = test_state().await;
        let app = create_router(state.clone());

        let response = app.clone().oneshot(command("/add MU793 R409 iPhone")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["data"]["is_error"], false);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/api/v1/targets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"][0]["display_name"], "iPhone");
        assert_eq!(body["data"][0]["id"]["location_id"], "R409");

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/api/v1/targets/MU793/R001")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        state.supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_bad_commands_are_rejected() {
        let app = create_router(test_state().await);

        let response = app.clone().oneshot(command("/explode")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);

        let response = app.oneshot(command("  ")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_routes_endpoint() {
        let app = create_router(test_state().await);
        let response = app
            .oneshot(Request::builder().uri("/api/v1/routes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["data"][0]["id"], "direct");
    }
}
