//! Error taxonomy for the marketplace core.
//!
//! Every fallible core operation returns [`CoreError`]; the axum layer maps
//! each variant onto the HTTP status contract (400 for client input/state,
//! 403 unauthorized, 404 not found, 503 when a retry is safe).

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;

pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// Malformed or missing input. Never retried, surfaced verbatim.
    #[error("{0}")]
    Validation(String),

    /// Caller does not own the resource.
    #[error("{0}")]
    Authorization(String),

    /// A precondition on entity state no longer holds (already approved,
    /// already paid, deadline passed). Clients must not blindly retry.
    #[error("{0}")]
    StateConflict(String),

    #[error("insufficient balance: available {available:.2}, required {required:.2}")]
    InsufficientBalance { available: f64, required: f64 },

    /// The payment gateway returned an error or was unreachable. `retryable`
    /// distinguishes unknown outcomes (timeout, 5xx) from gateway-side
    /// validation rejections.
    #[error("payment gateway error: {message}")]
    UpstreamGateway { message: String, retryable: bool },

    /// Amount/currency/reference mismatch during verification. Always fails
    /// the payment, never silently proceeds.
    #[error("consistency violation: {0}")]
    Consistency(String),

    #[error("{0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl CoreError {
    pub fn gateway_unreachable(message: impl Into<String>) -> Self {
        CoreError::UpstreamGateway {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn gateway_rejected(message: impl Into<String>) -> Self {
        CoreError::UpstreamGateway {
            message: message.into(),
            retryable: false,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::UpstreamGateway { retryable: true, .. })
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        let (status, retryable) = match &self {
            CoreError::Validation(_)
            | CoreError::StateConflict(_)
            | CoreError::InsufficientBalance { .. }
            | CoreError::Consistency(_) => (StatusCode::BAD_REQUEST, false),
            CoreError::Authorization(_) => (StatusCode::FORBIDDEN, false),
            CoreError::NotFound(_) => (StatusCode::NOT_FOUND, false),
            CoreError::UpstreamGateway { retryable, .. } => {
                if *retryable {
                    (StatusCode::SERVICE_UNAVAILABLE, true)
                } else {
                    (StatusCode::BAD_REQUEST, false)
                }
            }
            CoreError::Storage(err) => {
                tracing::error!("storage error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, false)
            }
            CoreError::Encoding(err) => {
                tracing::error!("encoding error: {}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, false)
            }
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "internal server error".to_string()
        } else {
            self.to_string()
        };

        let body = Json(json!({
            "error": message,
            "retryable": retryable,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(CoreError::gateway_unreachable("timeout").is_retryable());
        assert!(!CoreError::gateway_rejected("bad card").is_retryable());
        assert!(!CoreError::Validation("missing field".into()).is_retryable());
    }

    #[test]
    fn insufficient_balance_message() {
        let err = CoreError::InsufficientBalance {
            available: 12.5,
            required: 50.0,
        };
        assert_eq!(
            err.to_string(),
            "insufficient balance: available 12.50, required 50.00"
        );
    }
}
