//! Crate error types with HTTP status code mapping.
//!
//! [`SseError`] is the central error type. Programmer-misuse errors (pushing
//! to a dead session, registering a dead session) are returned synchronously
//! to the caller. Transport-level faults are never surfaced as errors — they
//! drive the session's disconnect transition instead.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::session::SessionId;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 2001,
///     "message": "connection closed",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Numeric error code (see code ranges on [`SseError`]).
    pub code: u32,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Error enum for all fallible operations in the crate.
///
/// # Error Code Ranges
///
/// | Range     | Category       | HTTP Status                |
/// |-----------|----------------|----------------------------|
/// | 1000–1999 | Construction   | 400 Bad Request            |
/// | 2000–2999 | Lifecycle      | 409 Conflict               |
/// | 3000–3999 | Serialization  | 422 Unprocessable Entity   |
#[derive(Debug, thiserror::Error)]
pub enum SseError {
    /// The session is no longer (or not yet) connected; the operation
    /// produced no wire output.
    #[error("connection closed")]
    ConnectionClosed,

    /// Attempted to register a session that is not connected.
    #[error("cannot register disconnected session {0}")]
    Registration(SessionId),

    /// The incoming request was missing or carried malformed fields needed
    /// to construct a connection.
    #[error("connection construction failed: {0}")]
    Construction(String),

    /// JSON encoding of an event payload failed.
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SseError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u32 {
        match self {
            Self::Construction(_) => 1001,
            Self::ConnectionClosed => 2001,
            Self::Registration(_) => 2002,
            Self::Serialization(_) => 3001,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Construction(_) => StatusCode::BAD_REQUEST,
            Self::ConnectionClosed | Self::Registration(_) => StatusCode::CONFLICT,
            Self::Serialization(_) => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }
}

impl IntoResponse for SseError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}
