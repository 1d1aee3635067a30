//! Error types for the wwwhisper gateway

use std::io;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

/// Result type alias for the gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// The auth backend could not be reached
    #[error("Auth backend unreachable: {0}")]
    BackendUnreachable(String),

    /// The auth backend did not answer in time
    #[error("Auth backend timeout: {0}")]
    BackendTimeout(String),

    /// The authorization query returned a status outside {200, 401, 403}
    #[error("Unexpected auth backend status: {0}")]
    UnexpectedBackendStatus(u16),

    /// The auth backend replied with a body over the size limit (bytes)
    #[error("Auth backend reply larger than {0} bytes")]
    BackendReplyTooLarge(usize),

    /// The wrapped application could not be reached or sent a broken body
    #[error("Application error: {0}")]
    Application(String),

    /// The client's request body could not be buffered for forwarding
    #[error("Request body rejected: {0}")]
    RequestBody(String),

    /// Response rewriter driven out of order
    #[error("Rewrite error: {0}")]
    Rewrite(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify an outbound HTTP failure talking to the auth backend
    #[must_use]
    pub fn from_backend(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::BackendTimeout(err.to_string())
        } else {
            Self::BackendUnreachable(err.to_string())
        }
    }

    /// HTTP status surfaced to the client for this error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BackendUnreachable(_)
            | Self::BackendReplyTooLarge(_)
            | Self::UnexpectedBackendStatus(_)
            | Self::Application(_) => StatusCode::BAD_GATEWAY,
            Self::BackendTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::RequestBody(_) => StatusCode::PAYLOAD_TOO_LARGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        error!(error = %self, status = status.as_u16(), "Request failed");
        // Details stay in the log; the client only sees the status line.
        let reason = status.canonical_reason().unwrap_or("Error");
        (status, [("content-type", "text/plain; charset=utf-8")], reason).into_response()
    }
}
