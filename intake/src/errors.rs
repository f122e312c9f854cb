use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error as ThisError;

use crate::api::models::requests::IntakeErrorResponse;
use crate::pipeline::IntakeError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed request: bad multipart data, missing request id, invalid JSON
    #[error("{message}")]
    BadRequest { message: String },

    /// A file or the number of files exceeds the configured limits
    #[error("{message}")]
    PayloadTooLarge { message: String },

    /// Request body is neither multipart nor JSON
    #[error("Unsupported content type: {content_type}")]
    UnsupportedMediaType { content_type: String },

    /// The pipeline rejected or failed the request
    #[error(transparent)]
    Intake(#[from] IntakeError),

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Error::UnsupportedMediaType { .. } => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::Intake(err) => match err {
                IntakeError::KeyDerivation(_) => StatusCode::BAD_REQUEST,
                IntakeError::Upload(_) | IntakeError::Publish { .. } => StatusCode::BAD_GATEWAY,
            },
            Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::BadRequest { message } | Error::PayloadTooLarge { message } => message.clone(),
            Error::UnsupportedMediaType { content_type } => {
                format!("Unsupported content type '{content_type}'. Use multipart/form-data or application/json.")
            }
            Error::Intake(err) => IntakeErrorResponse::from_intake_error(err).message,
            Error::Internal { .. } | Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Intake(IntakeError::Upload(_) | IntakeError::Publish { .. }) => {
                tracing::warn!("Upstream error: {}", self);
            }
            Error::BadRequest { .. } | Error::PayloadTooLarge { .. } | Error::UnsupportedMediaType { .. } | Error::Intake(_) => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();

        match &self {
            // Pipeline failures carry structured detail the caller needs to retry or clean up
            Error::Intake(err) => (status, Json(IntakeErrorResponse::from_intake_error(err))).into_response(),
            _ => (status, self.user_message()).into_response(),
        }
    }
}

/// Convert from String errors (e.g., from external functions)
impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { operation: msg }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
