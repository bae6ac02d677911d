use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::election::current_leader;
use crate::error::{DistError, Result};
use crate::manager::registry::{read_slot, WorkerState};
use crate::namespace::{Layout, Namespace};
use crate::producer::{read_result, submit_task};

/// The dashboard reads the namespace directly through its own session, so it
/// shows the same state whichever peer currently manages the pool.
#[derive(Clone)]
pub struct DashboardState {
    pub ns: Arc<dyn Namespace>,
    pub layout: Layout,
}

#[derive(Serialize)]
struct ClusterStatusResponse {
    manager: Option<String>,
    workers: Vec<WorkerResponse>,
}

#[derive(Serialize)]
struct WorkerResponse {
    id: String,
    identity: String,
    state: String,
    current_task: Option<String>,
}

#[derive(Serialize)]
struct TasksResponse {
    pending: Vec<PendingTaskResponse>,
    results: Vec<ResultResponse>,
}

#[derive(Serialize)]
struct PendingTaskResponse {
    id: String,
    payload: String,
}

#[derive(Serialize)]
struct ResultResponse {
    id: String,
    worker_id: String,
    status: String,
    output: String,
    error: Option<String>,
    completed_at: String,
}

#[derive(Deserialize)]
struct SubmitTaskRequest {
    payload: String,
}

#[derive(Serialize)]
struct SubmitTaskResponse {
    success: bool,
    task_id: Option<String>,
    error: Option<String>,
}

/// Routes with permissive CORS.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/cluster", get(cluster_status_handler))
        .route("/api/tasks", get(list_tasks_handler).post(submit_task_handler))
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

fn unavailable(e: DistError) -> (StatusCode, String) {
    tracing::warn!(error = %e, "Dashboard read failed");
    (StatusCode::SERVICE_UNAVAILABLE, e.to_string())
}

async fn cluster_status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match cluster_status(&state).await {
        Ok(status) => Json(status).into_response(),
        Err(e) => unavailable(e).into_response(),
    }
}

async fn cluster_status(state: &DashboardState) -> Result<ClusterStatusResponse> {
    let ns = state.ns.as_ref();
    let layout = &state.layout;

    let mut workers = Vec::new();
    for id in ns.get_children(&layout.workers(), false).await? {
        let identity = match ns.get_data(&layout.worker(&id), false).await {
            Ok(data) => String::from_utf8_lossy(&data).into_owned(),
            // Removed while listing.
            Err(DistError::NoNode(_)) => continue,
            Err(e) => return Err(e),
        };
        let worker_state = match ns.get_data(&layout.worker_state(&id), false).await {
            Ok(data) => WorkerState::parse(&data)
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            Err(DistError::NoNode(_)) => WorkerState::Dead.to_string(),
            Err(e) => return Err(e),
        };
        let current_task = read_slot(ns, layout, &id).await?.map(|a| a.task_id);
        workers.push(WorkerResponse {
            id,
            identity,
            state: worker_state,
            current_task,
        });
    }

    Ok(ClusterStatusResponse {
        manager: current_leader(ns, layout).await?,
        workers,
    })
}

async fn list_tasks_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    match list_tasks(&state).await {
        Ok(tasks) => Json(tasks).into_response(),
        Err(e) => unavailable(e).into_response(),
    }
}

async fn list_tasks(state: &DashboardState) -> Result<TasksResponse> {
    let ns = state.ns.as_ref();
    let layout = &state.layout;

    let mut pending = Vec::new();
    for id in ns.get_children(&layout.tasks(), false).await? {
        match ns.get_data(&layout.task(&id), false).await {
            Ok(data) => pending.push(PendingTaskResponse {
                id,
                payload: String::from_utf8_lossy(&data).into_owned(),
            }),
            Err(DistError::NoNode(_)) => {}
            Err(e) => return Err(e),
        }
    }

    let mut results = Vec::new();
    for id in ns.get_children(&layout.results(), false).await? {
        if let Some(result) = read_result(ns, layout, &id).await? {
            results.push(ResultResponse {
                id,
                worker_id: result.worker_id.clone(),
                status: result.status.to_string(),
                output: result.output_lossy(),
                error: result.error.clone(),
                completed_at: result.completed_at.to_rfc3339(),
            });
        }
    }

    Ok(TasksResponse { pending, results })
}

async fn submit_task_handler(
    State(state): State<DashboardState>,
    Json(request): Json<SubmitTaskRequest>,
) -> impl IntoResponse {
    if request.payload.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(SubmitTaskResponse {
                success: false,
                task_id: None,
                error: Some("Payload must not be empty".to_string()),
            }),
        );
    }

    match submit_task(state.ns.as_ref(), &state.layout, request.payload.as_bytes()).await {
        Ok(task_id) => (
            StatusCode::OK,
            Json(SubmitTaskResponse {
                success: true,
                task_id: Some(task_id),
                error: None,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(SubmitTaskResponse {
                success: false,
                task_id: None,
                error: Some(e.to_string()),
            }),
        ),
    }
}
