//! Read-only status API.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/healthz` | Liveness of the daemon itself |
//! | GET | `/api/v1/workers[?role=R]` | Status of every worker, or of one role |
//! | GET | `/api/v1/workers/{role}/{worker}` | Full status of one worker |

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use fleet_plan::{PlanApi, PlanError};

#[derive(Clone)]
pub struct ApiState {
    pub plan: Arc<PlanApi>,
}

pub fn build_router(plan: Arc<PlanApi>) -> Router {
    let state = ApiState { plan };

    let api_routes = Router::new()
        .route("/workers", get(list_workers))
        .route("/workers/{role}/{worker}", get(get_worker))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(healthz).with_state(state))
}

#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn plan_error(e: PlanError) -> axum::response::Response {
    let status = match e {
        PlanError::UnknownRole(_) | PlanError::NoWorkers(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status).into_response()
}

#[derive(Serialize)]
struct Health<'a> {
    status: &'static str,
    domain: &'a str,
}

/// GET /healthz
async fn healthz(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(Health {
        status: "ok",
        domain: state.plan.domain(),
    })
    .into_response()
}

#[derive(Debug, Deserialize)]
pub struct WorkersQuery {
    pub role: Option<String>,
}

/// GET /api/v1/workers
async fn list_workers(
    State(state): State<ApiState>,
    Query(query): Query<WorkersQuery>,
) -> impl IntoResponse {
    let selector = query.role.as_deref().unwrap_or("all");
    match state.plan.status(selector) {
        Ok(details) => {
            let rows: Vec<_> = details.into_iter().map(|d| d.status).collect();
            ApiResponse::ok(rows).into_response()
        }
        Err(e) => plan_error(e),
    }
}

/// GET /api/v1/workers/{role}/{worker}
async fn get_worker(
    State(state): State<ApiState>,
    Path((role, worker)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.plan.worker_status(&role, &worker) {
        Ok(Some(detail)) => ApiResponse::ok(detail).into_response(),
        Ok(None) => error_response("worker not found", StatusCode::NOT_FOUND).into_response(),
        Err(e) => plan_error(e),
    }
}
