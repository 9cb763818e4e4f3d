pub mod health;
pub mod positions;
pub mod preparations;
pub mod routing;
pub mod trips;
pub mod ws;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::error::RoutingError;
use crate::models::position::{Identity, Role};
use crate::services::hub::HubError;
use crate::services::positions::PositionError;
use crate::services::transitions::TransitionError;
use crate::services::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        // Routing engine
        .route("/api/routing/route", post(routing::route))
        .route("/api/routing/matrix", post(routing::matrix))
        .route("/api/routing/optimize", post(routing::optimize))
        // Trip solver
        .route("/api/trips/optimize", post(trips::optimize))
        .route("/api/trips/health", get(trips::health))
        // Live positions
        .route("/api/positions", post(positions::report).get(positions::list))
        .route("/ws", get(ws::upgrade))
        // Preparations
        .route("/api/preparations", get(preparations::list))
        .route("/api/preparations/transitions/run", post(preparations::run_transitions))
        .route("/api/preparations/:id/out-of-service", post(preparations::out_of_service))
        .route("/api/preparations/:id/archive", post(preparations::archive))
        .route("/api/assets/:id/defect", put(preparations::set_defect))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl AppError {
    pub fn new(status: StatusCode, error: impl Into<anyhow::Error>) -> Self {
        Self {
            status,
            error: error.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, anyhow::anyhow!(message.into()))
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, anyhow::anyhow!(message.into()))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.error, "request failed");
        }
        (
            self.status,
            Json(json!({
                "error": self.error.to_string()
            })),
        )
            .into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err)
    }
}

impl From<RoutingError> for AppError {
    fn from(err: RoutingError) -> Self {
        let status = match &err {
            RoutingError::InsufficientInput(_) | RoutingError::MalformedInput(_) => {
                StatusCode::BAD_REQUEST
            }
            RoutingError::NoSolution(_) => StatusCode::UNPROCESSABLE_ENTITY,
            RoutingError::Unreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
            RoutingError::Rejected { .. } | RoutingError::InvalidResponse(_) => {
                StatusCode::BAD_GATEWAY
            }
        };
        Self::new(status, err)
    }
}

impl From<PositionError> for AppError {
    fn from(err: PositionError) -> Self {
        let status = match &err {
            PositionError::Invalid(_) => StatusCode::BAD_REQUEST,
            PositionError::Store(_) | PositionError::Directory(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        Self::new(status, err)
    }
}

impl From<HubError> for AppError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Position(e) => e.into(),
            HubError::Forbidden { .. } => Self::new(StatusCode::FORBIDDEN, err),
            HubError::UnknownConnection(_) => Self::new(StatusCode::NOT_FOUND, err),
        }
    }
}

impl From<TransitionError> for AppError {
    fn from(err: TransitionError) -> Self {
        let status = match &err {
            TransitionError::NotFound(_) | TransitionError::AssetNotFound(_) => StatusCode::NOT_FOUND,
            TransitionError::InvalidTransition { .. } => StatusCode::CONFLICT,
            TransitionError::ConfirmationRequired => StatusCode::PRECONDITION_REQUIRED,
            TransitionError::InvalidOffset(_) | TransitionError::Repository(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self::new(status, err)
    }
}

pub(crate) fn require_role(identity: &Identity, role: Role) -> Result<(), AppError> {
    if identity.role == role {
        Ok(())
    } else {
        Err(AppError::forbidden(format!(
            "{} role required, caller is {}",
            role.as_str(),
            identity.role.as_str()
        )))
    }
}
