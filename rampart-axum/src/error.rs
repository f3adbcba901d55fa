use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use rampart::{Error, LoginDenied};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Access from this IP address is blocked")]
    IpBlocked,

    #[error("IP address is whitelisted: {0}")]
    Whitelisted(String),

    #[error("Account is temporarily locked")]
    Locked { retry_after_ms: u64 },

    #[error("Too many requests")]
    RateLimited { retry_after_ms: u64 },

    #[error("Internal server error: {0}")]
    InternalError(String),
}

impl SecurityError {
    pub fn status(&self) -> StatusCode {
        match self {
            SecurityError::BadRequest(_) => StatusCode::BAD_REQUEST,
            SecurityError::Unauthorized => StatusCode::UNAUTHORIZED,
            SecurityError::IpBlocked => StatusCode::FORBIDDEN,
            SecurityError::Whitelisted(_) => StatusCode::CONFLICT,
            SecurityError::Locked { .. } => StatusCode::LOCKED,
            SecurityError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            SecurityError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn retry_after_ms(&self) -> Option<u64> {
        match self {
            SecurityError::Locked { retry_after_ms }
            | SecurityError::RateLimited { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

impl From<Error> for SecurityError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(e) => SecurityError::BadRequest(e.to_string()),
            Error::Reputation(e) => SecurityError::Whitelisted(e.to_string()),
            Error::Store(e) => {
                tracing::error!(error = %e, "Security state unavailable");
                SecurityError::InternalError(e.to_string())
            }
        }
    }
}

impl From<LoginDenied> for SecurityError {
    fn from(denied: LoginDenied) -> Self {
        match denied {
            LoginDenied::IpBlocked => SecurityError::IpBlocked,
            LoginDenied::Locked { retry_after_ms } => SecurityError::Locked { retry_after_ms },
        }
    }
}

impl IntoResponse for SecurityError {
    fn into_response(self) -> Response {
        let status = self.status();
        let retry_after_ms = self.retry_after_ms();

        let mut body = json!({
            "error": self.to_string(),
            "code": status.as_u16()
        });
        if let Some(retry_after_ms) = retry_after_ms {
            body["retry_after_ms"] = json!(retry_after_ms);
        }

        let mut response = (status, Json(body)).into_response();
        if let Some(retry_after_ms) = retry_after_ms {
            // Whole seconds, rounded up, never zero
            let seconds = retry_after_ms.div_ceil(1000).max(1);
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(seconds));
        }

        response
    }
}

pub type Result<T> = std::result::Result<T, SecurityError>;
