use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use herald_store::StoreError;
use serde::Serialize;
use thiserror::Error;

use crate::validation::ValidationError;

/// Failures surfaced by the presence core.
#[derive(Debug, Error)]
pub enum PresenceError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(
        "proxy id '{proxy_id}' already has a live heartbeat; another instance is running \
         (set HERALD_CRASH_RECOVERY=true if it crashed)"
    )]
    ImposterInstance { proxy_id: String },

    #[error("unparseable value {value:?} in {key} field {field}")]
    DataCorruption {
        key: String,
        field: String,
        value: String,
    },

    #[error("unknown proxy id: {0}")]
    UnknownProxy(String),

    #[error(transparent)]
    InvalidInput(#[from] ValidationError),

    #[error("profile lookup failed: {0}")]
    Lookup(String),
}

pub type Result<T> = std::result::Result<T, PresenceError>;

/// API error response structure
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: None,
        }
    }

    pub fn with_details(error: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            details: Some(details.into()),
        }
    }
}

/// HTTP-facing error type
#[derive(Debug)]
pub enum AppError {
    Presence(PresenceError),
    ValidationError(String),
    NotFound(&'static str),
    Conflict(String),
    Unauthorized,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::Presence(err) => {
                let (status, response) = match &err {
                    PresenceError::Store(store_err) => {
                        // Don't expose internal store errors
                        tracing::error!(?store_err, "store error while serving request");
                        (
                            StatusCode::SERVICE_UNAVAILABLE,
                            ErrorResponse::new(
                                "The shared store is unavailable. Please try again later.",
                            ),
                        )
                    }
                    PresenceError::UnknownProxy(proxy) => (
                        StatusCode::NOT_FOUND,
                        ErrorResponse::with_details("Unknown proxy", proxy.clone()),
                    ),
                    PresenceError::InvalidInput(validation) => {
                        tracing::warn!(validation_error = %validation, "Validation failed");
                        (
                            StatusCode::BAD_REQUEST,
                            ErrorResponse::new(validation.to_string()),
                        )
                    }
                    PresenceError::Lookup(reason) => {
                        tracing::warn!(%reason, "profile lookup failed");
                        (
                            StatusCode::BAD_GATEWAY,
                            ErrorResponse::new("Profile lookup failed"),
                        )
                    }
                    PresenceError::Configuration(_)
                    | PresenceError::ImposterInstance { .. }
                    | PresenceError::DataCorruption { .. } => {
                        tracing::error!(%err, "internal error while serving request");
                        (
                            StatusCode::INTERNAL_SERVER_ERROR,
                            ErrorResponse::new("An internal error occurred. Please try again later."),
                        )
                    }
                };
                (status, Json(response)).into_response()
            }
            AppError::ValidationError(msg) => {
                tracing::warn!(validation_error = %msg, "Validation failed");
                let error_response = ErrorResponse::new(msg);
                (StatusCode::BAD_REQUEST, Json(error_response)).into_response()
            }
            AppError::NotFound(what) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse::new(what))).into_response()
            }
            AppError::Conflict(msg) => {
                (StatusCode::CONFLICT, Json(ErrorResponse::new(msg))).into_response()
            }
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(ErrorResponse::new("Missing or invalid API token")),
            )
                .into_response(),
        }
    }
}

impl From<PresenceError> for AppError {
    fn from(err: PresenceError) -> Self {
        match err {
            PresenceError::InvalidInput(validation) => {
                AppError::ValidationError(validation.to_string())
            }
            other => AppError::Presence(other),
        }
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError::ValidationError(err.to_string())
    }
}
