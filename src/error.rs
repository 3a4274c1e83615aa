use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde_json::{Value, json};

use crate::quota::QuotaDecision;
use crate::trace;

/// Error taxonomy for the HTTP surface. Every handled failure renders the
/// `{error: {code, message, request_id}}` envelope; rich variants merge
/// extra fields into the error object.
#[derive(Debug)]
pub enum ApiError {
    Validation(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    InsufficientCredits {
        balance_credits: i64,
        required_credits: Decimal,
        topup_url: String,
    },
    QuotaExceeded {
        message: String,
        decision: QuotaDecision,
    },
    InvalidSignature,
    /// Upstream product service unreachable or 5xx.
    Upstream(String),
    /// Upstream non-2xx passed through with its body.
    UpstreamStatus { status: StatusCode, body: Value },
    Internal(String),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::Unauthorized(_) => "INVALID_TOKEN",
            ApiError::Forbidden(_) => "FORBIDDEN",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::InsufficientCredits { .. } => "INSUFFICIENT_CREDITS",
            ApiError::QuotaExceeded { .. } => "FREE_LIMIT_EXCEEDED",
            ApiError::InvalidSignature => "INVALID_SIGNATURE",
            ApiError::Upstream(_) => "SERVICE_UNAVAILABLE",
            ApiError::UpstreamStatus { .. } => "UPSTREAM_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) | ApiError::InvalidSignature => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            ApiError::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Upstream(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::UpstreamStatus { status, .. } => *status,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        // Upstream bodies are passed through verbatim, outside the envelope.
        if let ApiError::UpstreamStatus { status, body } = self {
            return (status, axum::Json(body)).into_response();
        }

        let status = self.status();
        let mut error = json!({
            "code": self.code(),
            "request_id": trace::current_request_id(),
        });

        match self {
            ApiError::Validation(msg)
            | ApiError::Unauthorized(msg)
            | ApiError::Forbidden(msg)
            | ApiError::NotFound(msg)
            | ApiError::Upstream(msg) => {
                error["message"] = json!(msg);
            }
            ApiError::InsufficientCredits {
                balance_credits,
                required_credits,
                topup_url,
            } => {
                error["message"] = json!(format!(
                    "Insufficient credits: required {required_credits}, available {balance_credits}"
                ));
                error["balance_credits"] = json!(balance_credits);
                error["required_credits"] = json!(required_credits.to_f64());
                error["topup_url"] = json!(topup_url);
            }
            ApiError::QuotaExceeded { message, decision } => {
                error["message"] = json!(message);
                error["remaining_today"] = json!(decision.remaining_daily);
                error["remaining_month"] = json!(decision.remaining_monthly);
                error["limit_today"] = json!(decision.limit_daily);
                error["limit_month"] = json!(decision.limit_monthly);
                error["resets_at"] = json!(decision.resets_daily.to_rfc3339());
            }
            ApiError::InvalidSignature => {
                error["message"] = json!("invalid signature");
            }
            ApiError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                error["message"] = json!("An unexpected error occurred");
            }
            ApiError::UpstreamStatus { .. } => unreachable!(),
        }

        (status, axum::Json(json!({ "error": error }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(format!("{err:#}"))
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        ApiError::Internal(format!("database: {err}"))
    }
}

impl From<crate::ledger::LedgerError> for ApiError {
    fn from(err: crate::ledger::LedgerError) -> Self {
        // Admission builds its own 402; a ledger failure after a successful
        // upstream call is a real inconsistency and surfaces as 500.
        ApiError::Internal(format!("ledger: {err}"))
    }
}

impl From<crate::quota::QuotaError> for ApiError {
    fn from(err: crate::quota::QuotaError) -> Self {
        // Quota store down: fail closed for anonymous traffic.
        ApiError::Upstream(format!("quota store unavailable: {err}"))
    }
}
