//! Error types for the connect client

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for connect client operations
pub type Result<T> = std::result::Result<T, ConnectError>;

/// A single per-parameter validation failure reported by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationErrorData {
    /// Human readable description of the failure
    pub message: String,
    /// Name of the offending endpoint parameter, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_name: Option<String>,
}

/// Authentication failures.
///
/// Cloneable so a single in-flight login attempt can hand the same outcome
/// to every caller waiting on it.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("Token endpoint returned {status}: {body}")]
    UnexpectedResponse { status: u16, body: String },

    #[error("Token request failed: {0}")]
    Transport(String),

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Token storage error: {0}")]
    Storage(String),

    #[error("Authentication aborted by logout")]
    Aborted,
}

/// Main error type for connect client operations
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Missing or empty required call arguments
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// The request never produced a response (connection refused, DNS, reset)
    #[error("HTTP error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The request was cancelled by `logout()`
    #[error("Request aborted")]
    Aborted,

    /// Structured error body `{message, type, detail?}`
    #[error("{message}")]
    Endpoint {
        message: String,
        error_type: Option<String>,
        detail: Option<serde_json::Value>,
    },

    /// Structured error body carrying `validationErrorData`
    #[error("{message}")]
    Validation {
        message: String,
        error_type: Option<String>,
        validation_error_data: Vec<ValidationErrorData>,
    },

    /// Non-JSON error body, kept verbatim
    #[error("{body}")]
    Response { status: u16, body: String },

    /// Every failure collected during one deferred call drain
    #[error("{} deferred call(s) failed", .0.len())]
    DeferredCalls(Vec<ConnectError>),

    #[error("Storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Not connected: {0}")]
    Disconnected(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConnectError {
    /// True when the server could not be reached at all.
    ///
    /// Any HTTP response, even an error status, is not a network error.
    pub fn is_network_error(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Auth(AuthError::Transport(_)) => true,
            _ => false,
        }
    }

    /// The server supplied `type` of an endpoint or validation error
    pub fn error_type(&self) -> Option<&str> {
        match self {
            Self::Endpoint { error_type, .. } | Self::Validation { error_type, .. } => {
                error_type.as_deref()
            }
            _ => None,
        }
    }

    /// Validation failures, empty for every other variant
    pub fn validation_errors(&self) -> &[ValidationErrorData] {
        match self {
            Self::Validation {
                validation_error_data,
                ..
            } => validation_error_data,
            _ => &[],
        }
    }

    /// HTTP status of a raw error response
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Response { status, .. } => Some(*status),
            Self::Auth(AuthError::UnexpectedResponse { status, .. }) => Some(*status),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_error_display_uses_message() {
        let err = ConnectError::Endpoint {
            message: "Something broke".into(),
            error_type: Some("com.example.Broken".into()),
            detail: None,
        };
        assert_eq!(err.to_string(), "Something broke");
        assert_eq!(err.error_type(), Some("com.example.Broken"));
        assert!(err.validation_errors().is_empty());
        assert!(!err.is_network_error());
    }

    #[test]
    fn test_deferred_calls_display_counts_failures() {
        let err = ConnectError::DeferredCalls(vec![
            ConnectError::Aborted,
            ConnectError::Response {
                status: 500,
                body: "boom".into(),
            },
        ]);
        assert_eq!(err.to_string(), "2 deferred call(s) failed");
    }

    #[test]
    fn test_validation_error_data_wire_names() {
        let data: ValidationErrorData =
            serde_json::from_str(r#"{"message":"must be positive","parameterName":"age"}"#)
                .unwrap();
        assert_eq!(data.parameter_name.as_deref(), Some("age"));
    }
}
