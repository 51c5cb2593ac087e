use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use cadence_core::config::CadenceConfig;
use cadence_scheduler::SchedulerHandle;

use crate::http::{health, jobs};

/// Shared state, passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    pub config: CadenceConfig,
    pub scheduler: SchedulerHandle,
}

impl AppState {
    pub fn new(config: CadenceConfig, scheduler: SchedulerHandle) -> Self {
        Self { config, scheduler }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route(
            "/api/v1/cron/jobs",
            get(jobs::list_jobs)
                .post(jobs::upsert_job)
                .delete(jobs::delete_job),
        )
        .route("/api/v1/cron/jobs/enable", post(jobs::enable_job))
        .route("/api/v1/cron/jobs/test", post(jobs::test_job))
        .route("/api/v1/cron/jobs/runs", get(jobs::list_runs))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
