//! Error taxonomy and its HTTP rendering.
//!
//! Upload and service failures reach the client as a structured body with a
//! message, a cause, status details and a fix suggestion. Schema invariant
//! violations are internal errors and are logged loudly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

pub const DEFAULT_FIX_SUGGESTION: &str = "Please download the latest version of the metadata spreadsheet and fill it in again.";

pub const CONTACT_FIX_SUGGESTION: &str =
    "Please send the detailed error message to the service maintainers with the subject \"Metadata Validator Error\".";

/// Body rendered for every user-facing error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub message: String,
    #[serde(default)]
    pub cause: String,
    #[serde(default = "not_available")]
    pub status_info: String,
    #[serde(default)]
    pub fix_suggestion: Option<String>,
}

fn not_available() -> String {
    "N/A".to_string()
}

/// A referenced column has no descriptor in the schema.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("missing column descriptor for '{0}'")]
    MissingColumn(String),
}

/// The uploaded file cannot be used. The upload must be retried from scratch.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message} {cause}")]
pub struct InputFileError {
    pub message: String,
    pub cause: String,
}

impl InputFileError {
    pub fn invalid(cause: impl Into<String>) -> Self {
        Self {
            message: "Invalid input metadata file.".to_string(),
            cause: cause.into(),
        }
    }
}

/// The validation service answered with an error or could not be reached.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{}: {}", .0.message, .0.cause)]
pub struct ServiceError(pub ErrorBody);

impl ServiceError {
    pub fn unreachable(cause: impl Into<String>) -> Self {
        Self(ErrorBody {
            message: "Unable to reach the validation service.".to_string(),
            cause: cause.into(),
            status_info: not_available(),
            fix_suggestion: None,
        })
    }
}

/// Errors surfaced by HTTP handlers.
#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    InputFile(#[from] InputFileError),
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            Self::InputFile(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Service(_) => StatusCode::BAD_GATEWAY,
            Self::SessionNotFound(_) => StatusCode::NOT_FOUND,
            Self::Schema(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> ErrorBody {
        match self {
            Self::InputFile(e) => ErrorBody {
                message: e.message.clone(),
                cause: e.cause.clone(),
                status_info: not_available(),
                fix_suggestion: Some(DEFAULT_FIX_SUGGESTION.to_string()),
            },
            Self::Service(e) => {
                let mut body = e.0.clone();
                if body.fix_suggestion.is_none() {
                    body.fix_suggestion = Some(CONTACT_FIX_SUGGESTION.to_string());
                }
                body
            }
            other => ErrorBody {
                message: other.to_string(),
                cause: String::new(),
                status_info: other.status().to_string(),
                fix_suggestion: None,
            },
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (status, Json(self.body())).into_response()
    }
}
