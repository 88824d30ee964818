use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::crypto::CryptoError;

/// Coded error returned to callers. Internal causes stay in the logs.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    InvalidArgument,
    Unauthenticated,
    PermissionDenied,
    NotFound,
    FailedPrecondition,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "invalid_argument",
            ErrorCode::Unauthenticated => "unauthenticated",
            ErrorCode::PermissionDenied => "permission_denied",
            ErrorCode::NotFound => "not_found",
            ErrorCode::FailedPrecondition => "failed_precondition",
            ErrorCode::Internal => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidArgument | ErrorCode::FailedPrecondition => StatusCode::BAD_REQUEST,
            ErrorCode::Unauthenticated => StatusCode::UNAUTHORIZED,
            ErrorCode::PermissionDenied => StatusCode::FORBIDDEN,
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl VaultError {
    pub fn code(&self) -> ErrorCode {
        match self {
            VaultError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            VaultError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            VaultError::PermissionDenied(_) => ErrorCode::PermissionDenied,
            VaultError::NotFound(_) => ErrorCode::NotFound,
            VaultError::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            VaultError::Database(_) | VaultError::Crypto(_) | VaultError::Internal(_) => {
                ErrorCode::Internal
            }
        }
    }

    /// Message safe to hand back to the caller.
    pub fn public_message(&self) -> String {
        match self {
            VaultError::InvalidArgument(message)
            | VaultError::Unauthenticated(message)
            | VaultError::PermissionDenied(message)
            | VaultError::NotFound(message)
            | VaultError::FailedPrecondition(message) => message.clone(),
            VaultError::Database(_) | VaultError::Crypto(_) | VaultError::Internal(_) => {
                "internal error".to_string()
            }
        }
    }
}

impl IntoResponse for VaultError {
    fn into_response(self) -> Response {
        let code = self.code();
        if code == ErrorCode::Internal {
            tracing::error!(error = %self, "request failed");
        }
        let body = json!({
            "code": code.as_str(),
            "message": self.public_message(),
        });
        (code.status(), Json(body)).into_response()
    }
}

pub type VaultResult<T> = Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_causes_are_not_exposed() {
        let err = VaultError::Database(sqlx::Error::RowNotFound);
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(err.public_message(), "internal error");

        let err = VaultError::Crypto(CryptoError::Authentication);
        assert_eq!(err.code(), ErrorCode::Internal);
        assert_eq!(err.code().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn caller_errors_keep_their_message() {
        let err = VaultError::PermissionDenied("insufficient role: required=writer".into());
        assert_eq!(err.code().as_str(), "permission_denied");
        assert_eq!(err.code().status(), StatusCode::FORBIDDEN);
        assert_eq!(err.public_message(), "insufficient role: required=writer");
    }
}
