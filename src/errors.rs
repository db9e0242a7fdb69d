//! Error types for the git-http-gateway crate.
//!
//! This module defines the single error enumeration surfaced by every stage of a
//! gateway invocation: repository/identity resolution, backend spawn, stream pumping
//! and CGI header parsing. It integrates with `thiserror` for `Display` and source
//! chaining, and with axum so the router adapter can turn a failure straight into
//! an HTTP response.
//!
//! Notes:
//! - Nothing here is retried; retries belong to the git client re-issuing the request.
//! - Resolution errors are always raised before a backend process exists.

use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

#[derive(Error, Debug)]
/// Unified error enumeration for a gateway invocation.
pub enum GatewayError {
    /// The repository name did not resolve to a directory under the base path.
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    /// The identity provider could not supply a committer identity.
    #[error("Identity unavailable: {0}")]
    IdentityUnavailable(String),

    /// The request does not address one of the git CGI endpoints.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// The endpoint exists but does not accept the request method.
    #[error("Method {method} not allowed for {path_info}")]
    MethodNotAllowed { method: String, path_info: String },

    /// The backend binary is missing or could not be started.
    #[error("Failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// I/O error while pumping the request or response body.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The backend produced a CGI header block the strict policy rejects.
    #[error("Malformed CGI headers: {0}")]
    MalformedHeaders(String),

    /// The invocation was cancelled before it completed.
    #[error("Request cancelled")]
    Cancelled,

    /// Configuration or other internal failure.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn repository_not_found(name: &str) -> Self {
        GatewayError::RepositoryNotFound(name.to_string())
    }

    pub fn invalid_request(msg: &str) -> Self {
        GatewayError::InvalidRequest(msg.to_string())
    }

    pub fn malformed_headers(msg: impl Into<String>) -> Self {
        GatewayError::MalformedHeaders(msg.into())
    }

    /// HTTP status used when the failure happens before any response byte is sent.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::RepositoryNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::IdentityUnavailable(_) => StatusCode::UNAUTHORIZED,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::MalformedHeaders(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Spawn { .. }
            | GatewayError::Io(_)
            | GatewayError::Cancelled
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Convert into an `io::Error` so the failure can travel inside a body stream.
    pub fn into_io(self) -> io::Error {
        match self {
            GatewayError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}
