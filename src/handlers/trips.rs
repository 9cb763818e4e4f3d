use axum::{extract::State, Json};
use chrono::{DateTime, FixedOffset};
use serde::Deserialize;
use std::sync::Arc;

use super::AppError;
use crate::middleware::auth::AuthenticatedAgent;
use crate::models::geo::Coordinate;
use crate::models::routing::{RoutingSolution, TripStop};
use crate::services::trip_optimizer::{SolverHealth, TripRequestOptions};
use crate::services::AppState;

#[derive(Deserialize)]
pub struct OptimizeTripRequest {
    pub stops: Vec<TripStop>,
    #[serde(default)]
    pub depot: Option<Coordinate>,
    pub start_time: DateTime<FixedOffset>,
    #[serde(default)]
    pub end_time: Option<DateTime<FixedOffset>>,
    #[serde(default)]
    pub use_cache: Option<bool>,
}

pub async fn optimize(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(caller): AuthenticatedAgent,
    Json(body): Json<OptimizeTripRequest>,
) -> Result<Json<RoutingSolution>, AppError> {
    let opts = TripRequestOptions {
        depot: body.depot,
        start_time: body.start_time,
        end_time: body.end_time,
        use_cache: body.use_cache.unwrap_or(true),
    };
    tracing::debug!(agent_id = %caller.agent_id, stops = body.stops.len(), "trip optimization requested");
    let solution = state.trips.optimize_trip(&body.stops, &opts).await?;
    Ok(Json(solution))
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<SolverHealth> {
    Json(state.trips.health().await)
}
