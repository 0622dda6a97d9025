//! Error types for rmc-coord
//!
//! [`Error`] covers failures inside the coordination engine. Per-cell
//! failures (capture start, timeout, abort, device error, retry exhaustion)
//! are contained by the workers and only ever reach the log and the status
//! line; the HTTP layer converts the rest through [`ApiError`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use rmc_common::MeasurementKey;
use serde_json::json;
use thiserror::Error;

use crate::device::DeviceError;

/// Coordination engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// The start request was rejected before the device accepted the job
    #[error("Failed to start capture for {key}: {source}")]
    CaptureStart {
        key: String,
        #[source]
        source: DeviceError,
    },

    #[error("No completion signal for {0} within the operation ceiling")]
    CoordinatorTimeout(String),

    #[error("Operation {0} was aborted")]
    CoordinatorAbort(String),

    /// Device reported failure
    #[error("Device reported error for {key}: {message}")]
    CoordinatorError { key: String, message: String },

    /// Non-fatal: the cell is skipped and the sweep continues
    #[error("Retries exhausted for {key} after {attempts} attempts")]
    RetryExhausted { key: MeasurementKey, attempts: u32 },

    /// Non-fatal: the unverified result is kept
    #[error("RTA window collected {collected} samples, {required} required")]
    RtaInsufficientSamples { collected: usize, required: usize },

    #[error("Failed to rename {id} to {name}: {source}")]
    RenameFailed {
        id: String,
        name: String,
        #[source]
        source: DeviceError,
    },

    #[error("No sweep stimulus found for channel {0}")]
    StimulusMissing(String),

    #[error("Playback error: {0}")]
    Playback(String),

    /// Another worker holds the session lock
    #[error("A {0} session is already running")]
    Busy(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Device(#[from] DeviceError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Request validation and lookups shared with the common crate
    #[error(transparent)]
    Common(#[from] rmc_common::Error),
}

/// Result type for coordination engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Conflict (409) - e.g., a sweep is already running
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Engine(#[from] Error),

    #[error("Common error: {0}")]
    Common(#[from] rmc_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Engine(Error::Common(inner)) = self {
            return ApiError::Common(inner).into_response();
        }

        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Engine(ref err) => match err {
                Error::Busy(_) => (StatusCode::CONFLICT, "SESSION_BUSY", err.to_string()),
                Error::InvalidState(_) => (StatusCode::CONFLICT, "INVALID_STATE", err.to_string()),
                Error::StimulusMissing(_) => {
                    (StatusCode::BAD_REQUEST, "STIMULUS_MISSING", err.to_string())
                }
                Error::Device(_) | Error::CaptureStart { .. } => {
                    (StatusCode::BAD_GATEWAY, "DEVICE_ERROR", err.to_string())
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "ENGINE_ERROR", err.to_string()),
            },
            ApiError::Common(ref err) => match err {
                rmc_common::Error::InvalidInput(_) => {
                    (StatusCode::BAD_REQUEST, "BAD_REQUEST", err.to_string())
                }
                rmc_common::Error::NotFound(_) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", err.to_string())
                }
                _ => (StatusCode::INTERNAL_SERVER_ERROR, "COMMON_ERROR", err.to_string()),
            },
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = std::result::Result<T, ApiError>;
