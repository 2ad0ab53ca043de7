//! HTTP and WebSocket surface.

pub mod auth;
pub mod error;
mod routes;
mod workers;
mod ws;

use std::sync::Arc;

use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use auth::{Authenticator, HeaderAuthenticator, Principal, WorkerCaller};
pub use error::ApiError;

use crate::orchestrator::Orchestrator;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub auth: Arc<dyn Authenticator>,
    /// Bearer token required on the worker routes, if any.
    pub worker_token: Option<Arc<str>>,
}

/// Build the router with the user, worker and push routes.
pub fn router(
    orchestrator: Arc<Orchestrator>,
    auth: Arc<dyn Authenticator>,
    worker_token: Option<String>,
) -> Router {
    let state = AppState {
        orchestrator,
        auth,
        worker_token: worker_token.map(Arc::from),
    };

    Router::new()
        .route("/health", get(health))
        .route("/addTask", post(routes::add_task))
        .route("/getTasks", get(routes::get_tasks))
        .route("/getTask", get(routes::get_task))
        .route("/getWorkersInfo", get(routes::get_workers))
        .route("/getDelays", get(routes::get_delays))
        .route("/updateDelays", post(routes::update_delays))
        .route("/getInfo", get(routes::get_info))
        .route("/ws", get(ws::ws_handler))
        .route("/internal/workers/{id}/heartbeat", post(workers::heartbeat))
        .route("/internal/workers/{id}/next", post(workers::next))
        .route("/internal/results", post(workers::report))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "calc-orchestrator"
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn app() -> Router {
        let orch = Orchestrator::new(SchedulerConfig::default(), None);
        router(orch, Arc::new(HeaderAuthenticator), None)
    }

    fn guarded_app() -> Router {
        let orch = Orchestrator::new(SchedulerConfig::default(), None);
        router(orch, Arc::new(HeaderAuthenticator), Some("s3cret".into()))
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn health_reports_service() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: serde_json::Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["service"], "calc-orchestrator");
    }

    #[tokio::test]
    async fn user_routes_require_identity() {
        for path in ["/getTasks", "/getInfo", "/getTask?id=1"] {
            let response = app()
                .oneshot(Request::get(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{path}");
        }
    }

    #[tokio::test]
    async fn add_task_rejects_bad_syntax_as_plain_text() {
        let response = app()
            .oneshot(
                Request::post("/addTask")
                    .header("x-user-id", "1")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"task":"2+"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!body_text(response).await.is_empty());
    }

    #[tokio::test]
    async fn next_is_no_content_when_idle() {
        let response = app()
            .oneshot(
                Request::post("/internal/workers/w1/next")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn worker_routes_check_token_when_configured() {
        for path in [
            "/internal/workers/w1/next",
            "/internal/workers/w1/heartbeat",
            "/internal/results",
        ] {
            let response = guarded_app()
                .oneshot(Request::post(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{path}");
        }

        let response = guarded_app()
            .oneshot(
                Request::post("/internal/workers/w1/next")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = guarded_app()
            .oneshot(
                Request::post("/internal/workers/w1/next")
                    .header("authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
}
