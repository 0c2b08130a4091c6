use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;

/// Error taxonomy shared by the ledger, booking manager and settlement
/// processor. Conflicting-state errors are never swallowed; callers branch on
/// the variant. The webhook path maps everything to a provider response code
/// instead of surfacing these.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("booking exceeds the limit of {limit} seats (requested {requested})")]
    MaxTicketsExceeded { requested: usize, limit: usize },

    #[error("no seats available for this show")]
    ShowFull,

    #[error("{0} not found")]
    NotFound(String),

    #[error("seat {0} is not available")]
    SeatUnavailable(String),

    #[error("{0}")]
    Conflict(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("payment gateway unavailable: {0}")]
    GatewayUnavailable(String),

    #[error("internal inconsistency: {0}")]
    InternalInconsistency(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::Validation(_) | AppError::MaxTicketsExceeded { .. } => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ShowFull
            | AppError::SeatUnavailable(_)
            | AppError::Conflict(_)
            | AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::GatewayUnavailable(_) => StatusCode::BAD_GATEWAY,
            AppError::InternalInconsistency(_) | AppError::Database(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        if status.is_server_error() {
            tracing::error!("request failed: {:?}", self);
        }

        (status, Json(json!({ "success": false, "message": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
