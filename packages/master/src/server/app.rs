//! Application setup.

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use ffrtmp_core::{RetryPolicy, Store};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::scheduler::SchedulerMetrics;
use crate::server::middleware::bearer_auth;
use crate::server::routes::{health, jobs, nodes, results};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub metrics: Arc<SchedulerMetrics>,
    pub retry: RetryPolicy,
    pub auth_token: Option<String>,
}

/// Build the router. `/health` stays outside the auth layer; everything
/// else requires the bearer token when one is configured.
pub fn build_app(state: AppState) -> Router {
    let authed = Router::new()
        .route("/nodes/register", post(nodes::register_node))
        .route("/nodes", get(nodes::list_nodes))
        .route("/nodes/:id", get(nodes::get_node))
        .route("/nodes/:id/heartbeat", post(nodes::node_heartbeat))
        .route("/jobs", post(jobs::create_job).get(jobs::list_jobs))
        .route("/jobs/next", get(jobs::next_job))
        .route("/jobs/:id", get(jobs::get_job))
        .route("/jobs/:id/logs", get(jobs::job_logs))
        .route("/jobs/:id/claim", post(jobs::claim_job))
        .route("/jobs/:id/heartbeat", post(jobs::job_heartbeat))
        .route("/jobs/:id/pause", post(jobs::pause_job))
        .route("/jobs/:id/resume", post(jobs::resume_job))
        .route("/jobs/:id/cancel", post(jobs::cancel_job))
        .route("/results", post(results::report_result))
        .route("/stats", get(health::stats_handler))
        .layer(middleware::from_fn_with_state(state.clone(), bearer_auth));

    Router::new()
        .route("/health", get(health::health_handler))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
