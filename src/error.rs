use thiserror::Error;

/// Failure of a call to an external routing or optimization engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RoutingError {
    /// Too few stops or coordinates; no request was issued.
    #[error("insufficient input: {0}")]
    InsufficientInput(String),
    /// The request could not be built from the given input; no request was issued.
    #[error("malformed input: {0}")]
    MalformedInput(String),
    #[error("routing upstream unreachable: {0}")]
    Unreachable(String),
    #[error("routing upstream rejected the request (status {status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("no solution found: {0}")]
    NoSolution(String),
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl RoutingError {
    /// Short classification tag used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            RoutingError::InsufficientInput(_) => "insufficient_input",
            RoutingError::MalformedInput(_) => "malformed_input",
            RoutingError::Unreachable(_) => "upstream_unreachable",
            RoutingError::Rejected { .. } => "upstream_rejected",
            RoutingError::NoSolution(_) => "no_solution",
            RoutingError::InvalidResponse(_) => "invalid_response",
        }
    }

    /// True when the failure was detected locally, before any network call.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            RoutingError::InsufficientInput(_) | RoutingError::MalformedInput(_)
        )
    }
}
