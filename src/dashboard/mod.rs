use std::net::SocketAddr;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get},
    Json, Router,
};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::error::SchedError;
use crate::scheduler::{SchedContext, Scheduler, WorkerDiag};

#[derive(Clone)]
pub struct DashboardState {
    pub scheduler: Scheduler,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct RemoveResponse {
    removed: bool,
    sched_id: String,
}

fn error_response(status: StatusCode, e: SchedError) -> axum::response::Response {
    (status, Json(ErrorResponse { error: e.to_string() })).into_response()
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/sched", get(sched_info_handler))
        .route("/api/workers", get(list_workers_handler))
        .route("/api/requests/{id}", delete(remove_request_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn sched_info_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.scheduler.info(&SchedContext::new()).await {
        Ok(info) => Json(info).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

async fn list_workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match state.scheduler.info(&SchedContext::new()).await {
        Ok(info) => Json::<Vec<WorkerDiag>>(info.workers).into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}

async fn remove_request_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let sched_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("invalid request id: {}", e),
                }),
            )
                .into_response()
        }
    };

    match state.scheduler.remove_request(&SchedContext::new(), sched_id).await {
        Ok(()) => Json(RemoveResponse {
            removed: true,
            sched_id: sched_id.to_string(),
        })
        .into_response(),
        Err(e @ SchedError::RequestNotFound(_)) => error_response(StatusCode::NOT_FOUND, e),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, e),
    }
}
