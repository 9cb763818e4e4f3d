use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::{require_role, AppError};
use crate::middleware::auth::AuthenticatedAgent;
use crate::models::position::Role;
use crate::models::preparation::{PreparationRecord, PreparationStatus};
use crate::services::transitions::TransitionReport;
use crate::services::AppState;

#[derive(Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
}

#[derive(Deserialize)]
pub struct ArchiveRequest {
    #[serde(default)]
    pub confirmed: bool,
}

#[derive(Deserialize)]
pub struct DefectRequest {
    pub defect: bool,
}

pub async fn list(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(_caller): AuthenticatedAgent,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<PreparationRecord>>, AppError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<PreparationStatus>)
        .transpose()
        .map_err(AppError::bad_request)?;
    let records = state.transitions.engine().list(status).await?;
    Ok(Json(records))
}

pub async fn out_of_service(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(caller): AuthenticatedAgent,
    Path(id): Path<Uuid>,
) -> Result<Json<PreparationRecord>, AppError> {
    require_role(&caller, Role::Observer)?;
    let record = state
        .transitions
        .engine()
        .mark_out_of_service(id, Utc::now())
        .await?;
    Ok(Json(record))
}

pub async fn archive(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(caller): AuthenticatedAgent,
    Path(id): Path<Uuid>,
    Json(body): Json<ArchiveRequest>,
) -> Result<Json<PreparationRecord>, AppError> {
    require_role(&caller, Role::Observer)?;
    let record = state
        .transitions
        .engine()
        .archive(id, body.confirmed, Utc::now())
        .await?;
    Ok(Json(record))
}

pub async fn set_defect(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(caller): AuthenticatedAgent,
    Path(asset_id): Path<Uuid>,
    Json(body): Json<DefectRequest>,
) -> Result<StatusCode, AppError> {
    require_role(&caller, Role::Observer)?;
    state
        .transitions
        .engine()
        .set_asset_defect(asset_id, body.defect)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Runs the transition rules now instead of waiting for the next tick.
pub async fn run_transitions(
    State(state): State<Arc<AppState>>,
    AuthenticatedAgent(caller): AuthenticatedAgent,
) -> Result<Json<TransitionReport>, AppError> {
    require_role(&caller, Role::Observer)?;
    match state.transitions.trigger(Utc::now()).await {
        Some(report) => Ok(Json(report?)),
        None => Err(AppError::new(
            StatusCode::CONFLICT,
            anyhow::anyhow!("a transition run is already in progress"),
        )),
    }
}
