use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};

use crate::engine::Engine;
use crate::scheduler::job::JobSnapshot;

#[derive(Clone)]
pub struct DashboardState {
    pub engine: Arc<Engine>,
}

#[derive(Serialize)]
struct QueueResponse {
    id: String,
    name: String,
    pending: Vec<String>,
}

#[derive(Serialize)]
struct WorkerResponse {
    id: String,
    pool_id: u32,
    state: String,
    identity: String,
    metadata: BTreeMap<String, String>,
}

/// Read-only status routes. Exposed separately from [`run_dashboard`] so the
/// router can be driven without a listener.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/jobs", get(list_jobs_handler))
        .route("/api/queue", get(queue_handler))
        .route("/api/workers", get(list_workers_handler))
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

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let mut jobs: Vec<JobSnapshot> = Vec::new();
    for job in state.engine.jobs().await {
        jobs.push(job.snapshot().await);
    }
    Json(jobs)
}

async fn queue_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let queue = state.engine.queue();
    let queue = queue.read().await;
    Json(QueueResponse {
        id: queue.id().to_string(),
        name: queue.name().to_string(),
        pending: queue.task_ids().iter().map(|id| id.to_string()).collect(),
    })
}

async fn list_workers_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let pool = state.engine.pool();
    let pool = pool.read().await;
    let workers: Vec<WorkerResponse> = pool
        .workers()
        .iter()
        .map(|w| WorkerResponse {
            id: w.id().to_string(),
            pool_id: w.pool_id(),
            state: w.state().to_string(),
            identity: w.to_string(),
            metadata: w.metadata(),
        })
        .collect();
    Json(workers)
}
