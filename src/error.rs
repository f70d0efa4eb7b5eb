use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

/// The main error type for querygate.
///
/// Limit denials are deliberately NOT represented here: "limit exceeded"
/// is an expected business outcome carried in [`crate::limiter::LimitDecision`],
/// not a system error.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// Missing, invalid, or expired session. The user must re-authenticate.
    #[error("Unauthorized: {0}")]
    Auth(String),

    /// The entitlement store or billing oracle is unreachable.
    ///
    /// Dependent operations fail closed: the action is denied, never allowed.
    #[error("Entitlement state unavailable: {0}")]
    EntitlementUnavailable(String),

    /// Webhook signature verification failed; the payload is untrusted
    /// and must not be processed. No redelivery is requested.
    #[error("Invalid webhook signature")]
    SignatureInvalid,

    /// The completion provider call failed (non-2xx, timeout, malformed
    /// payload). Recoverable; no quota is consumed.
    #[error("Completion failed: {0}")]
    Completion(String),

    /// Malformed request body or parameters.
    #[error("Bad request: {0}")]
    Validation(String),

    /// An external call exceeded its hard timeout.
    #[error("Request timeout")]
    Timeout,

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl GateError {
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::EntitlementUnavailable(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::EntitlementUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::SignatureInvalid | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Completion(_) => StatusCode::BAD_GATEWAY,
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            Self::Database(_) | Self::Internal(_) | Self::Anyhow(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to expose to clients.
    ///
    /// Client errors (4xx) carry their real message; server errors hide
    /// details (CWE-209) and are only logged server-side.
    fn safe_message(&self) -> String {
        match self {
            Self::Auth(_) | Self::SignatureInvalid | Self::Validation(_) | Self::Timeout => {
                self.to_string()
            }
            Self::EntitlementUnavailable(_) => {
                "Subscription state is being verified, please retry shortly".to_string()
            }
            Self::Completion(_) => "The assistant is temporarily unavailable".to_string(),
            Self::Database(_) => "Database error".to_string(),
            Self::Internal(_) | Self::Anyhow(_) => "Internal server error".to_string(),
        }
    }
}

/// Standard error response body.
#[derive(Serialize)]
struct ErrorBody {
    error: String,
    error_id: String,
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_id = uuid::Uuid::new_v4().to_string();

        // Full detail stays in server logs only.
        tracing::error!(
            status = status.as_u16(),
            error_id = %error_id,
            error = %self,
            "request failed"
        );

        let body = Json(ErrorBody {
            error: self.safe_message(),
            error_id,
        });

        (status, body).into_response()
    }
}

/// Result type alias used throughout querygate.
pub type Result<T> = std::result::Result<T, GateError>;

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            GateError::Validation(format!("JSON error: {}", err))
        } else {
            GateError::Internal(format!("JSON serialization error: {}", err))
        }
    }
}

impl From<reqwest::Error> for GateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            GateError::Timeout
        } else if err.is_connect() {
            GateError::EntitlementUnavailable(format!("connection error: {}", err))
        } else {
            GateError::Internal(format!("request error: {}", err))
        }
    }
}

#[cfg(feature = "database")]
impl From<sea_orm::DbErr> for GateError {
    fn from(err: sea_orm::DbErr) -> Self {
        GateError::Database(err.to_string())
    }
}
