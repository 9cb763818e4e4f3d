use axum::{extract::State, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::services::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub connections: usize,
    pub solver: Option<&'static str>,
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        connections: state.hub.connection_count(),
        solver: state.trips.backend_name(),
    })
}
