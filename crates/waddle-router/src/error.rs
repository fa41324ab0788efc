use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Structured API error: HTTP status plus a stable machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: "VALIDATION_ERROR",
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            code: "AUTH_ERROR",
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            code: "PERMISSION_ERROR",
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: "NOT_FOUND",
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::CONFLICT,
            code: "CONFLICT",
            message: message.into(),
        }
    }

    pub fn too_many_requests(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::TOO_MANY_REQUESTS,
            code: "RATE_LIMITED",
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "INTERNAL_ERROR",
            message: message.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(json!({ "error": self.message, "code": self.code })),
        )
            .into_response()
    }
}

impl From<waddle_registry::error::RegistryError> for ApiError {
    fn from(e: waddle_registry::error::RegistryError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<waddle_sessions::error::SessionError> for ApiError {
    fn from(e: waddle_sessions::error::SessionError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<waddle_rbac::error::RbacError> for ApiError {
    fn from(e: waddle_rbac::error::RbacError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<waddle_accounts::error::AccountError> for ApiError {
    fn from(e: waddle_accounts::error::AccountError) -> Self {
        match e {
            waddle_accounts::error::AccountError::NotFound(_) => ApiError::not_found(e.to_string()),
            waddle_accounts::error::AccountError::DuplicateName(_) => {
                ApiError::conflict(e.to_string())
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}

impl From<waddle_coordination::error::CoordinationError> for ApiError {
    fn from(e: waddle_coordination::error::CoordinationError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<waddle_strings::error::StringMatchError> for ApiError {
    fn from(e: waddle_strings::error::StringMatchError) -> Self {
        match e {
            waddle_strings::error::StringMatchError::RuleNotFound(_) => {
                ApiError::not_found(e.to_string())
            }
            other => ApiError::internal(other.to_string()),
        }
    }
}
