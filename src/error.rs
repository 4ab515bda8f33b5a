//! # Error Handling
//!
//! Custom error types for the voice-agent session and how they're converted to
//! HTTP responses for the credential and session endpoints.
//!
//! ## Propagation policy:
//! - **Component-local** problems (malformed JSON frames, empty audio chunks,
//!   events from a superseded connection) are logged where they are detected
//!   and never turned into an `AppError`.
//! - **Escalation-worthy** conditions (retry budget exhausted, microphone
//!   unavailable) become `AppError::RateLimited` / `AppError::Device` and are
//!   surfaced through the session snapshot.
//! - **External calls** (credential fetch, socket connect, device acquisition)
//!   return `AppResult<T>` so callers can use `?`.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **ValidationError**: Data validation failed (400 errors)
/// - **Credential**: The short-lived agent key could not be obtained (502 errors)
/// - **Transport**: The agent socket failed to open or broke (502 errors)
/// - **Device**: Microphone or speaker could not be acquired (503 errors)
/// - **RateLimited**: Reconnect budget exhausted, session is terminal (429 errors)
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

    /// Credential endpoint or key management API failure
    Credential(String),

    /// Agent socket failure
    Transport(String),

    /// Audio device acquisition or stream failure
    Device(String),

    /// Too many consecutive reconnects without reaching CONNECTED
    RateLimited { attempts: u32 },
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::ValidationError(msg) => write!(f, "Validation error: {}", msg),
            AppError::Credential(msg) => write!(f, "Credential error: {}", msg),
            AppError::Transport(msg) => write!(f, "Transport error: {}", msg),
            AppError::Device(msg) => write!(f, "Device error: {}", msg),
            AppError::RateLimited { attempts } => {
                write!(f, "Rate limited after {} reconnect attempts", attempts)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl AppError {
    /// Machine-readable error type used in JSON error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Internal(_) => "internal_error",
            AppError::BadRequest(_) => "bad_request",
            AppError::ConfigError(_) => "config_error",
            AppError::ValidationError(_) => "validation_error",
            AppError::Credential(_) => "credential_error",
            AppError::Transport(_) => "transport_error",
            AppError::Device(_) => "device_error",
            AppError::RateLimited { .. } => "rate_limited",
        }
    }
}

/// Converts errors into HTTP responses.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500
/// - BadRequest/ValidationError → 400
/// - Credential/Transport → 502
/// - Device → 503
/// - RateLimited → 429
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "credential_error",
///     "message": "no API key configured",
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
            AppError::Credential(_) | AppError::Transport(_) => StatusCode::BAD_GATEWAY,
            AppError::Device(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let message = match self {
            AppError::Internal(msg)
            | AppError::BadRequest(msg)
            | AppError::ConfigError(msg)
            | AppError::ValidationError(msg)
            | AppError::Credential(msg)
            | AppError::Transport(msg)
            | AppError::Device(msg) => msg.clone(),
            AppError::RateLimited { .. } => self.to_string(),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": self.kind(),
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

/// JSON parsing errors are almost always caused by the peer sending malformed
/// data, so they map to BadRequest rather than Internal.
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

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Credential(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for AppError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        AppError::Transport(err.to_string())
    }
}

impl From<hound::Error> for AppError {
    fn from(err: hound::Error) -> Self {
        AppError::Device(format!("WAV error: {}", err))
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::StatusCode;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::Credential("x".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::RateLimited { attempts: 5 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::ValidationError("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_display_includes_attempts() {
        let err = AppError::RateLimited { attempts: 5 };
        assert_eq!(err.to_string(), "Rate limited after 5 reconnect attempts");
        assert_eq!(err.kind(), "rate_limited");
    }

    #[test]
    fn test_config_error_is_internal() {
        let err: AppError = config::ConfigError::Message("bad port".into()).into();
        assert_eq!(err.kind(), "config_error");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_json_error_maps_to_bad_request() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let err: AppError = parse_err.into();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
