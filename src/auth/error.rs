use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::DbError;

/// Errors surfaced by the SSO federation layer.
///
/// Each variant maps to one HTTP status; see [`SsoError::status`].
#[derive(Debug, Error)]
pub enum SsoError {
    /// Provider configuration is invalid or incomplete
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The IdP response failed verification or was malformed
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The CSRF state token is missing or does not match
    #[error("state error: {0}")]
    State(String),

    /// The user could not be provisioned
    #[error("provisioning error: {0}")]
    Provisioning(String),

    /// The provider does not allow just-in-time provisioning
    #[error("automatic provisioning is disabled for provider '{0}'")]
    ProvisioningDisabled(String),

    #[error("provider not found: {0}")]
    ProviderNotFound(String),

    #[error("provider '{0}' is disabled")]
    ProviderDisabled(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SsoError {
    pub fn status(&self) -> StatusCode {
        match self {
            SsoError::Configuration(_) | SsoError::State(_) => StatusCode::BAD_REQUEST,
            SsoError::Protocol(_) => StatusCode::UNAUTHORIZED,
            SsoError::ProvisioningDisabled(_) | SsoError::ProviderDisabled(_) => {
                StatusCode::FORBIDDEN
            }
            SsoError::ProviderNotFound(_) => StatusCode::NOT_FOUND,
            SsoError::Conflict(_) => StatusCode::CONFLICT,
            SsoError::Provisioning(_) | SsoError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error code used in response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SsoError::Configuration(_) => "configuration_error",
            SsoError::Protocol(_) => "protocol_error",
            SsoError::State(_) => "state_error",
            SsoError::Provisioning(_) => "provisioning_error",
            SsoError::ProvisioningDisabled(_) => "provisioning_disabled",
            SsoError::ProviderNotFound(_) => "not_found",
            SsoError::ProviderDisabled(_) => "provider_disabled",
            SsoError::Conflict(_) => "conflict",
            SsoError::Internal(_) => "internal_error",
        }
    }

    /// Shorthand for a configuration error naming a missing field.
    pub fn missing_field(field: &str) -> Self {
        SsoError::Configuration(format!("missing required field: {field}"))
    }
}

impl From<DbError> for SsoError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound => SsoError::ProviderNotFound("record not found".to_string()),
            DbError::Conflict(msg) => SsoError::Conflict(msg),
            other => SsoError::Internal(other.to_string()),
        }
    }
}

/// JSON error body: `{"error": {"code": "...", "message": "..."}}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorInfo {
                code: code.into(),
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for SsoError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Internal details stay in the logs
        let message = match &self {
            SsoError::Provisioning(_) | SsoError::Internal(_) => {
                tracing::error!(error = %self, "SSO request failed");
                match &self {
                    SsoError::Provisioning(_) => "failed to provision user".to_string(),
                    _ => "internal server error".to_string(),
                }
            }
            _ => {
                tracing::debug!(error = %self, status = %status, "SSO request rejected");
                self.to_string()
            }
        };

        (status, Json(ErrorResponse::new(self.code(), message))).into_response()
    }
}
