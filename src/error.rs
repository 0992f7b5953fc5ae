//! Error types for the gate and JSON error responses for the HTTP surface

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Malformed configuration, either process-wide or on a single container
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration '{value}' for {field}")]
    InvalidDuration { field: String, value: String },

    #[error("invalid boolean '{value}' for {field}")]
    InvalidBool { field: String, value: String },

    #[error("unrecognized freeze method '{0}' (expected 'stop' or 'pause')")]
    InvalidFreezeMethod(String),

    #[error("name '{name}' is claimed by {count} containers")]
    DuplicateName { name: String, count: usize },

    #[error("failed to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse configuration file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Failure reported by the container runtime adapter
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("container '{0}' not found")]
    NotFound(String),

    #[error("container '{id}' is in a conflicting state: {message}")]
    Conflict { id: String, message: String },

    #[error("runtime call timed out after {0:?}")]
    Timeout(Duration),

    #[error("runtime transport error: {0}")]
    Transport(String),

    #[error("runtime returned {status}: {message}")]
    Server { status: u16, message: String },
}

impl RuntimeError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            RuntimeError::Timeout(_) | RuntimeError::Transport(_) => true,
            RuntimeError::Server { status, .. } => *status >= 500,
            RuntimeError::NotFound(_) | RuntimeError::Conflict { .. } => false,
        }
    }
}

/// A freeze, thaw or inspect that could not be completed for one container
#[derive(Debug, Error, Clone)]
pub enum LifecycleError {
    #[error("failed to freeze '{name}': {source}")]
    FreezeFailed {
        name: String,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to thaw '{name}': {source}")]
    ThawFailed {
        name: String,
        #[source]
        source: RuntimeError,
    },

    #[error("failed to inspect '{name}': {source}")]
    InspectFailed {
        name: String,
        #[source]
        source: RuntimeError,
    },
}

impl LifecycleError {
    /// Name of the container the failure belongs to
    pub fn name(&self) -> &str {
        match self {
            LifecycleError::FreezeFailed { name, .. }
            | LifecycleError::ThawFailed { name, .. }
            | LifecycleError::InspectFailed { name, .. } => name,
        }
    }

    /// The underlying runtime failure
    pub fn runtime_error(&self) -> &RuntimeError {
        match self {
            LifecycleError::FreezeFailed { source, .. }
            | LifecycleError::ThawFailed { source, .. }
            | LifecycleError::InspectFailed { source, .. } => source,
        }
    }
}

/// Errors surfaced by gate-level operations
#[derive(Debug, Error)]
pub enum GateError {
    #[error("failed to list containers: {0}")]
    Discovery(#[source] RuntimeError),

    #[error("gate is shut down")]
    Stopped,
}

/// Error codes for gate responses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateErrorCode {
    /// No usable `name` query parameter
    MissingName,
    /// None of the requested names are managed
    NoSuchName,
    /// A requested container has unusable configuration
    InvalidConfig,
    /// Container discovery failed during reload
    ReloadFailed,
    /// Unknown route
    NotFound,
    /// Internal gate error
    InternalError,
}

impl GateErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GateErrorCode::MissingName
            | GateErrorCode::NoSuchName
            | GateErrorCode::InvalidConfig => StatusCode::IM_A_TEAPOT,
            GateErrorCode::ReloadFailed => StatusCode::SERVICE_UNAVAILABLE,
            GateErrorCode::NotFound => StatusCode::NOT_FOUND,
            GateErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Gate-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            GateErrorCode::MissingName => "MISSING_NAME",
            GateErrorCode::NoSuchName => "NO_SUCH_NAME",
            GateErrorCode::InvalidConfig => "INVALID_CONFIG",
            GateErrorCode::ReloadFailed => "RELOAD_FAILED",
            GateErrorCode::NotFound => "NOT_FOUND",
            GateErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: GateErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: GateErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Gate-Error header
pub fn json_error_response(code: GateErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Gate-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(GateErrorCode::MissingName.status_code(), StatusCode::IM_A_TEAPOT);
        assert_eq!(GateErrorCode::NoSuchName.status_code(), StatusCode::IM_A_TEAPOT);
        assert_eq!(
            GateErrorCode::ReloadFailed.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(GateErrorCode::NotFound.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(GateErrorCode::ReloadFailed, "docker is down");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"RELOAD_FAILED\""));
        assert!(json.contains("\"message\":\"docker is down\""));
        assert!(json.contains("\"status\":503"));
    }

    #[test]
    fn test_json_error_response() {
        let response = json_error_response(GateErrorCode::NotFound, "no route");

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(response.headers().get("X-Gate-Error").unwrap(), "NOT_FOUND");
    }

    #[test]
    fn test_transient_classification() {
        assert!(RuntimeError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(RuntimeError::Transport("connection reset".into()).is_transient());
        assert!(RuntimeError::Server {
            status: 500,
            message: "boom".into()
        }
        .is_transient());
        assert!(!RuntimeError::Server {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
        assert!(!RuntimeError::NotFound("abc".into()).is_transient());
        assert!(!RuntimeError::Conflict {
            id: "abc".into(),
            message: "is paused".into()
        }
        .is_transient());
    }

    #[test]
    fn test_lifecycle_error_accessors() {
        let err = LifecycleError::ThawFailed {
            name: "web".into(),
            source: RuntimeError::NotFound("abc".into()),
        };
        assert_eq!(err.name(), "web");
        assert_eq!(err.runtime_error(), &RuntimeError::NotFound("abc".into()));
        assert!(err.to_string().contains("failed to thaw 'web'"));
    }
}
