use axum::{extract::State, Json};
use serde::Deserialize;
use std::sync::Arc;

use super::AppError;
use crate::middleware::auth::AuthenticatedAgent;
use crate::models::geo::Coordinate;
use crate::models::routing::{DistanceMatrix, OrderedRoute, RouteSummary};
use crate::services::route_client::{RouteOptions, TripEndpoint, TripOptions};
use crate::services::AppState;

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct RouteRequest {
    pub coordinates: Vec<Coordinate>,
    #[serde(default = "default_true")]
    pub geometry: bool,
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

#[derive(Deserialize)]
pub struct MatrixRequest {
    pub coordinates: Vec<Coordinate>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

#[derive(Deserialize)]
pub struct OptimizeRequest {
    pub coordinates: Vec<Coordinate>,
    #[serde(default = "default_true")]
    pub roundtrip: bool,
    #[serde(default)]
    pub source: Option<TripEndpoint>,
    #[serde(default)]
    pub destination: Option<TripEndpoint>,
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

pub async fn route(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(_caller): AuthenticatedAgent,
    Json(body): Json<RouteRequest>,
) -> Result<Json<RouteSummary>, AppError> {
    let opts = RouteOptions {
        geometry: body.geometry,
        use_cache: body.use_cache,
    };
    let summary = state.routes.try_route(&body.coordinates, &opts).await?;
    Ok(Json(summary))
}

pub async fn matrix(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(_caller): AuthenticatedAgent,
    Json(body): Json<MatrixRequest>,
) -> Result<Json<DistanceMatrix>, AppError> {
    let matrix = state
        .routes
        .try_matrix(&body.coordinates, body.use_cache)
        .await?;
    Ok(Json(matrix))
}

pub async fn optimize(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(_caller): AuthenticatedAgent,
    Json(body): Json<OptimizeRequest>,
) -> Result<Json<OrderedRoute>, AppError> {
    let defaults = TripOptions::default();
    let opts = TripOptions {
        roundtrip: body.roundtrip,
        source: body.source.unwrap_or(defaults.source),
        destination: body.destination.unwrap_or(if body.roundtrip {
            defaults.destination
        } else {
            TripEndpoint::Last
        }),
        use_cache: body.use_cache,
    };
    let route = state
        .routes
        .try_optimize_route(&body.coordinates, &opts)
        .await?;
    Ok(Json(route))
}
