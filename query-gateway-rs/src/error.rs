//! Gateway error taxonomy and its HTTP representation.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use config_rs::ConfigError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::validation::ApiValidationError;

/// Structured error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// No registered service matches the query
    #[error("no registered service can answer this query")]
    NoRoute { implied_tags: Vec<String> },

    #[error("unknown service `{0}`")]
    UnknownService(String),

    #[error("service `{0}` is already registered")]
    DuplicateService(String),

    #[error("invalid service definition: {0}")]
    InvalidService(String),

    #[error("conversation `{0}` belongs to another user")]
    ConversationForbidden(String),

    #[error(transparent)]
    Validation(#[from] ApiValidationError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("gateway not ready: {0}")]
    NotReady(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NoRoute { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::UnknownService(_) => StatusCode::NOT_FOUND,
            Self::DuplicateService(_) | Self::InvalidService(_) | Self::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::ConversationForbidden(_) => StatusCode::FORBIDDEN,
            Self::Validation(err) => err.status_code(),
            Self::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable error kind
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoRoute { .. } => "NO_ROUTE",
            Self::UnknownService(_) => "UNKNOWN_SERVICE",
            Self::DuplicateService(_) => "DUPLICATE_SERVICE",
            Self::InvalidService(_) => "INVALID_SERVICE",
            Self::ConversationForbidden(_) => "CONVERSATION_FORBIDDEN",
            Self::Validation(err) => err.kind(),
            Self::Config(_) => "CONFIGURATION",
            Self::NotReady(_) => "NOT_READY",
            Self::Internal(_) => "INTERNAL",
        }
    }

    pub fn to_error_response(&self) -> ErrorResponse {
        let details = match self {
            Self::NoRoute { implied_tags } if !implied_tags.is_empty() => {
                Some(vec![format!("implied capability tags: {}", implied_tags.join(", "))])
            }
            Self::Validation(err) => err.details(),
            _ => None,
        };

        ErrorResponse {
            error: self.to_string(),
            code: self.status_code().as_u16(),
            kind: self.kind().to_string(),
            details,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(kind = self.kind(), error = %self, "Request failed");
        } else {
            tracing::debug!(kind = self.kind(), error = %self, "Request rejected");
        }
        (status, Json(self.to_error_response())).into_response()
    }
}
