//! HTTP side of position tracking. `POST` is the backup channel used by
//! field devices alongside their socket connection.

use axum::{extract::State, http::StatusCode, Json};
use chrono::Utc;
use std::sync::Arc;

use super::{require_role, AppError};
use crate::middleware::auth::AuthenticatedAgent;
use crate::models::position::{AgentPosition, AgentSnapshot, PositionReport, Role};
use crate::services::AppState;

pub async fn report(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(caller): AuthenticatedAgent,
    Json(report): Json<PositionReport>,
) -> Result<(StatusCode, Json<AgentPosition>), AppError> {
    require_role(&caller, Role::FieldAgent)?;
    let position = state.positions.record(&caller.agent_id, &report).await?;
    Ok((StatusCode::ACCEPTED, Json(position)))
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(caller): AuthenticatedAgent,
) -> Result<Json<Vec<AgentSnapshot>>, AppError> {
    require_role(&caller, Role::Observer)?;
    let snapshot = state.positions.snapshot(Utc::now()).await?;
    Ok(Json(snapshot))
}
