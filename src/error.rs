//! # Error Handling
//!
//! Two layers of errors live here:
//!
//! - [`TranscriptionError`]: the failure taxonomy of the audio pipeline
//!   (normalizer, segmenter, model manager, job workers). It knows nothing
//!   about HTTP and is safe to move across threads and into job records.
//! - [`AppError`]: what HTTP handlers return. It implements actix's
//!   `ResponseError`, so a handler can use `?` and the client gets a
//!   consistent JSON body.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Enums for Error Types
//! - **Variants**: Each variant is one failure category
//! - **Data**: Variants carry a message, or structured fields when the caller
//!   needs them (see `FrameSize`)
//!
//! ### Traits for Error Conversion
//! - **From trait**: lets `?` turn a pipeline error into an HTTP error
//! - **ResponseError trait**: converts errors to HTTP responses
//! - **Display trait**: defines how errors are formatted as strings

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Failure categories of the transcription pipeline.
///
/// ## Where each one comes from:
/// - **Validation**: input rejected before any work starts (empty upload,
///   wrong extension, oversized payload)
/// - **Transcode**: the external converter could not start, exited non-zero,
///   timed out, or produced no audio
/// - **FrameSize**: a streaming frame did not have the configured byte length
/// - **Inference**: the engine is not ready, rejected its input, or faulted
/// - **EngineLoad**: the engine could not be loaded at startup
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionError {
    Validation(String),
    Transcode(String),
    FrameSize { expected: usize, actual: usize },
    Inference(String),
    EngineLoad(String),
}

impl TranscriptionError {
    /// Short machine-readable name, used in logs and job records.
    pub fn kind(&self) -> &'static str {
        match self {
            TranscriptionError::Validation(_) => "validation_error",
            TranscriptionError::Transcode(_) => "transcode_error",
            TranscriptionError::FrameSize { .. } => "frame_size_error",
            TranscriptionError::Inference(_) => "inference_error",
            TranscriptionError::EngineLoad(_) => "engine_load_error",
        }
    }
}

impl fmt::Display for TranscriptionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TranscriptionError::Validation(msg) => write!(f, "Validation error: {}", msg),
            TranscriptionError::Transcode(msg) => write!(f, "Transcode error: {}", msg),
            TranscriptionError::FrameSize { expected, actual } => write!(
                f,
                "Frame size error: expected {} bytes, got {}",
                expected, actual
            ),
            TranscriptionError::Inference(msg) => write!(f, "Inference error: {}", msg),
            TranscriptionError::EngineLoad(msg) => write!(f, "Engine load error: {}", msg),
        }
    }
}

impl std::error::Error for TranscriptionError {}

/// Candle surfaces tensor and device faults through its own error type;
/// inside an engine every one of them is an inference failure.
impl From<candle_core::Error> for TranscriptionError {
    fn from(err: candle_core::Error) -> Self {
        TranscriptionError::Inference(err.to_string())
    }
}

/// Errors returned from HTTP handlers.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **NotFound**: Requested resource doesn't exist (404 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **ServiceUnavailable**: The engine is not ready yet (503 errors)
///
/// ## Usage Example:
/// ```rust
/// return Err(AppError::NotFound(format!("Job {} not found", job_id)));
/// ```
#[derive(Debug)]
pub enum AppError {
    Internal(String),
    BadRequest(String),
    NotFound(String),
    ConfigError(String),
    ValidationError(String),
    ServiceUnavailable(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::ServiceUnavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Converts errors into HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "validation_error",
///     "message": "File type not allowed: .txt",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        use actix_web::http::StatusCode;
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::BadRequest(_) | AppError::ValidationError(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::BadRequest(msg) => ("bad_request", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
            AppError::ValidationError(msg) => ("validation_error", msg),
            AppError::ServiceUnavailable(msg) => ("service_unavailable", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always caused by the client.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<actix_multipart::MultipartError> for AppError {
    fn from(err: actix_multipart::MultipartError) -> Self {
        AppError::BadRequest(format!("Malformed multipart body: {}", err))
    }
}

/// Pipeline errors surfacing in a synchronous handler.
///
/// ## Mapping:
/// - Validation / FrameSize → 400
/// - Transcode → 400 (the upload could not be decoded)
/// - Inference → 500
/// - EngineLoad → 503
impl From<TranscriptionError> for AppError {
    fn from(err: TranscriptionError) -> Self {
        match err {
            TranscriptionError::Validation(msg) => AppError::ValidationError(msg),
            TranscriptionError::FrameSize { .. } => AppError::BadRequest(err.to_string()),
            TranscriptionError::Transcode(msg) => {
                AppError::BadRequest(format!("Could not decode audio: {}", msg))
            }
            TranscriptionError::Inference(msg) => AppError::Internal(msg),
            TranscriptionError::EngineLoad(msg) => AppError::ServiceUnavailable(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_codes() {
        assert_eq!(AppError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::ValidationError("x".into()).status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::ServiceUnavailable("x".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_transcription_error_mapping() {
        let err: AppError = TranscriptionError::Transcode("exit status 1".into()).into();
        assert!(matches!(err, AppError::BadRequest(_)));

        let err: AppError = TranscriptionError::EngineLoad("no weights".into()).into();
        assert!(matches!(err, AppError::ServiceUnavailable(_)));

        let err: AppError = TranscriptionError::Inference("boom".into()).into();
        assert!(matches!(err, AppError::Internal(_)));
    }

    #[test]
    fn test_frame_size_display() {
        let err = TranscriptionError::FrameSize { expected: 960, actual: 100 };
        assert_eq!(err.to_string(), "Frame size error: expected 960 bytes, got 100");
        assert_eq!(err.kind(), "frame_size_error");
    }
}
