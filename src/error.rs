//! # Error Handling
//!
//! This module defines the two error families used by the service:
//!
//! - **SessionError**: failures inside the live voice session (devices, network,
//!   malformed audio). These drive the session state machine.
//! - **AppError**: failures surfaced through the HTTP API, converted to JSON
//!   responses.
//!
//! ## Key Rust Concepts for Error Handling:
//!
//! ### Result<T, E> Type
//! - **Purpose**: Forces you to handle both success and failure cases
//! - **No exceptions**: Rust doesn't have try/catch, it uses Result instead
//!
//! ### Enums for Error Types
//! - **Variants**: Each enum variant represents a different kind of error
//! - **Pattern matching**: Use `match` to decide how each failure is handled
//!
//! ### Traits for Error Conversion
//! - **From trait**: Automatically converts between error types
//! - **ResponseError trait**: Converts errors to HTTP responses
//! - **thiserror**: Derives `Display` and `std::error::Error` from attributes

use actix_web::{HttpResponse, ResponseError};  // Web framework error handling
use serde_json::json;                          // For creating JSON error responses
use std::fmt;                                  // For implementing Display trait
use thiserror::Error;                          // Derive macro for SessionError

/// Failures that can happen while a voice session is running.
///
/// ## Propagation policy:
/// - **PermissionDenied / DeviceUnavailable**: capture or output side, fatal to
///   `start()`, never retried
/// - **TransportConnectFailed / TransportClosedUnexpectedly**: the duplex link is
///   broken, the controller tears the whole session down
/// - **TransportSendFailed**: a single frame could not be sent
/// - **MalformedAudioData**: one chunk is dropped, the session continues
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("Audio device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to connect to live service: {0}")]
    TransportConnectFailed(String),

    #[error("Failed to send audio frame: {0}")]
    TransportSendFailed(String),

    #[error("Live service closed the connection: {0}")]
    TransportClosedUnexpectedly(String),

    #[error("Malformed audio data: {0}")]
    MalformedAudioData(String),

    #[error("Session controller is not running")]
    ControllerUnavailable,
}

impl SessionError {
    /// Generic, user-facing description of the failure.
    ///
    /// Raw causes stay in the logs; callers only get a short notice.
    pub fn user_notice(&self) -> &'static str {
        match self {
            SessionError::PermissionDenied(_) => "Microphone access was denied",
            SessionError::DeviceUnavailable(_) => "Audio device is not available",
            SessionError::TransportConnectFailed(_) => "Could not reach the voice service",
            SessionError::TransportSendFailed(_) => "Audio could not be sent",
            SessionError::TransportClosedUnexpectedly(_) => "The voice service ended the session",
            SessionError::MalformedAudioData(_) => "Received unreadable audio",
            SessionError::ControllerUnavailable => "Voice session is unavailable",
        }
    }

    /// Whether this error is fatal to the running session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SessionError::MalformedAudioData(_) | SessionError::TransportSendFailed(_)
        )
    }
}

/// Result alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Custom error types for the HTTP layer.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Unavailable**: The session controller or an audio device is gone (503 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// User input failed validation rules
    ValidationError(String),

    /// A dependency of the request (device, controller) cannot serve it right now
    Unavailable(String),
}

/// Implementation of the Display trait for AppError.
///
/// ## Rust Concepts:
/// - **impl Trait for Type**: Implementing a trait for our custom type
/// - **match**: Pattern matching to handle each error variant
/// - **write!**: Macro for formatting strings (like printf in C)
impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Unavailable(msg) => write!(f, "Service unavailable: {}", msg),
        }
    }
}

/// Implementation of the ResponseError trait for AppError.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "unavailable",
///     "message": "Voice session is unavailable",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,  // 500
                "config_error",
                msg.clone(),
            ),
            AppError::ValidationError(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,  // 400
                "validation_error",
                msg.clone(),
            ),
            AppError::Unavailable(msg) => (
                actix_web::http::StatusCode::SERVICE_UNAVAILABLE,  // 503
                "unavailable",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

/// Automatic conversion from anyhow::Error to AppError.
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing errors are almost always the client's fault, so they map to 400.
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

/// Session failures reach HTTP clients only as the generic notice.
///
/// ## Why the notice and not the cause:
/// Device names and network errors are logged server-side; the API
/// promises no more than "something failed".
impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::ControllerUnavailable
            | SessionError::DeviceUnavailable(_)
            | SessionError::PermissionDenied(_) => AppError::Unavailable(err.user_notice().to_string()),
            _ => AppError::Internal(err.user_notice().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_audio_is_not_fatal() {
        assert!(!SessionError::MalformedAudioData("odd length".into()).is_fatal());
        assert!(SessionError::TransportClosedUnexpectedly("1006".into()).is_fatal());
        assert!(SessionError::PermissionDenied("denied".into()).is_fatal());
    }

    #[test]
    fn test_session_error_maps_to_generic_notice() {
        let err: AppError = SessionError::PermissionDenied("/dev/snd/pcmC0D0c busy".into()).into();
        match err {
            AppError::Unavailable(msg) => {
                assert_eq!(msg, "Microphone access was denied");
                assert!(!msg.contains("/dev/snd"));
            }
            other => panic!("unexpected mapping: {:?}", other),
        }
    }

    #[test]
    fn test_unavailable_response_status() {
        let response = AppError::Unavailable("gone".into()).error_response();
        assert_eq!(response.status(), actix_web::http::StatusCode::SERVICE_UNAVAILABLE);
    }
}
