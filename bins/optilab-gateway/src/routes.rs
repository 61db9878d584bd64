// Route table for the Optilab gateway

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::{handlers, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/execute", post(handlers::submit_execution))
        .route("/api/executions/:execution_id", get(handlers::get_execution))
        .route("/api/errors", get(handlers::recent_errors))
        .route("/ws/:execution_id", get(handlers::ws_handler))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_endpoint))
}
