//! Maps [`EngineError`] onto the wire error envelope (§7):
//! `{error: {code, message, details?, retryable?}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::errors::EngineError;

pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        let body = json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
                "retryable": self.0.retryable(),
            }
        });
        (status, Json(body)).into_response()
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::DatasetMissing(_) | EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::InvalidParam(_)
        | EngineError::DatasetUnreadable(_)
        | EngineError::SchemaMismatch(_)
        | EngineError::CausalFutureAccess { .. }
        | EngineError::ExecutionPrecondition(_)
        | EngineError::StatsWidthExceeded { .. }
        | EngineError::StatsInsufficientTrades(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Cancelled => StatusCode::OK,
        EngineError::RehydrateUnavailable(_) => StatusCode::CONFLICT,
        EngineError::Persist(_) | EngineError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
