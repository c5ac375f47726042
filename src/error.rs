//! Error types and rejection responses for the broker

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

/// Reasons a client session is turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// The session could not complete its handshake
    HandshakeFailed,
    /// The requested address matches no known pattern
    InvalidAddress,
    /// The address names an identifier with no provisioned artifact
    UnknownIdentifier,
    /// The backend could not be queried or started
    BackendUnavailable,
}

impl RejectReason {
    /// Message shown to the client
    pub fn message(&self) -> &'static str {
        match self {
            RejectReason::HandshakeFailed => "Failed to start game",
            RejectReason::InvalidAddress => "Invalid server address",
            RejectReason::UnknownIdentifier => "Invalid or outdated pull request",
            RejectReason::BackendUnavailable => "Failed to prepare server",
        }
    }

    /// HTTP status used by the HTTP session transport
    pub fn status_code(&self) -> StatusCode {
        match self {
            RejectReason::HandshakeFailed => StatusCode::BAD_REQUEST,
            RejectReason::InvalidAddress => StatusCode::NOT_FOUND,
            RejectReason::UnknownIdentifier => StatusCode::NOT_FOUND,
            RejectReason::BackendUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Get the reason as a string for the X-Broker-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            RejectReason::HandshakeFailed => "HANDSHAKE_FAILED",
            RejectReason::InvalidAddress => "INVALID_ADDRESS",
            RejectReason::UnknownIdentifier => "UNKNOWN_IDENTIFIER",
            RejectReason::BackendUnavailable => "BACKEND_UNAVAILABLE",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// Errors reported by a backend driver
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("docker: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("command `{command}` failed: {status}")]
    CommandFailed { command: String, status: String },
    #[error("{0} is not supported by this driver")]
    Unsupported(&'static str),
    #[error("{0}")]
    Other(String),
}

/// Errors produced while resolving an identifier to a running backend
///
/// Sources are reference counted so one failed start can be reported to every
/// caller that waited on it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ResolveError {
    #[error("failed to check artifact for {identifier}: {source}")]
    Artifact {
        identifier: String,
        source: Arc<std::io::Error>,
    },
    #[error("failed to query backend {identifier}: {source}")]
    Query {
        identifier: String,
        source: Arc<DriverError>,
    },
    #[error("failed to start backend {identifier}: {source}")]
    Start {
        identifier: String,
        source: Arc<DriverError>,
    },
    #[error("failed to stop backend {identifier}: {source}")]
    Stop {
        identifier: String,
        source: Arc<DriverError>,
    },
    #[error("backend {identifier} started but is unreachable")]
    Unreachable { identifier: String },
}

/// Errors raised by a session transport
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("session already answered")]
    AlreadyAnswered,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The rejection reason
    pub code: RejectReason,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: RejectReason) -> Self {
        Self {
            status: code.status_code().as_u16(),
            message: code.message().to_string(),
            code,
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

/// Create a JSON rejection response with X-Broker-Error header
pub fn json_error_response(code: RejectReason) -> Response<BoxBody<Bytes, hyper::Error>> {
    let body = ErrorResponse::new(code).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Broker-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
