use axum::{Json, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use serde_json::Value;

/// Single error taxonomy for the whole crate, mapped onto the `{error: {code, message, details?}}`
/// wire shape at the HTTP boundary. Background tasks match on the variants directly rather than
/// letting them escape to a caller.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("missing or invalid credential")]
    Unauthenticated,

    #[error("tenant/project mismatch")]
    Forbidden,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("monthly event quota exceeded")]
    QuotaExceeded,

    #[error("payload invalid")]
    PayloadInvalid { diagnostics: Vec<EventDiagnostic> },

    #[error("resource not found")]
    NotFound,

    #[error("downstream store unavailable: {0}")]
    DownstreamUnavailable(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct EventDiagnostic {
    pub index: usize,
    pub field: String,
    pub message: String,
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthenticated => "unauthenticated",
            AppError::Forbidden => "forbidden",
            AppError::RateLimited => "rate_limited",
            AppError::QuotaExceeded => "quota_exceeded",
            AppError::PayloadInvalid { .. } => "payload_invalid",
            AppError::NotFound => "not_found",
            AppError::DownstreamUnavailable(_) => "downstream_unavailable",
            AppError::Internal(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Unauthenticated => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AppError::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
            AppError::PayloadInvalid { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::DownstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            AppError::PayloadInvalid { diagnostics } => serde_json::to_value(diagnostics).ok(),
            _ => None,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorPayload,
}

#[derive(Serialize)]
struct ErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Value>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        if matches!(self, AppError::Internal(_) | AppError::DownstreamUnavailable(_)) {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::warn!(error = %self, "request rejected");
        }
        let status = self.status();
        let body = ErrorBody {
            error: ErrorPayload {
                code: self.code(),
                message: self.to_string(),
                details: self.details(),
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
