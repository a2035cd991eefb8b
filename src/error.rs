//! Crate-wide error taxonomy.
//!
//! Every fault the Execution Engine can surface maps to one of these
//! variants, which in turn maps to a `DGResponse` status and a stable,
//! caller-readable message. Messages never carry paths, stack frames, or
//! secrets — the `Display` string is the only thing handed back to callers.

use crate::model::DGResponse;

pub mod codes {
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const BACKPRESSURE: &str = "BACKPRESSURE";
    pub const HANDLER_FAILED: &str = "HANDLER_FAILED";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const TRANSPORT_FAILED: &str = "TRANSPORT_FAILED";
    pub const INTERNAL: &str = "INTERNAL";
}

/// Each variant is a per-request, recoverable-at-the-boundary fault: it
/// completes a result future with an `ERROR`/`TIMEOUT` response and never
/// tears down the Engine.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    #[error("Invalid or disabled API key")]
    AuthFailed,

    #[error("No handler for request_type={0}")]
    NotFound(String),

    #[error("supervisor or session limit reached")]
    Backpressure,

    #[error("handler failed: {0}")]
    HandlerFailed(String),

    #[error("handler did not complete within its time-to-live")]
    Timeout,

    #[error("could not publish to {channel}: {reason}")]
    TransportFailed { channel: String, reason: String },

    #[error("internal error")]
    Internal,
}

impl Error {
    pub fn code(&self) -> &'static str {
        match self {
            Error::AuthFailed => codes::AUTH_FAILED,
            Error::NotFound(_) => codes::NOT_FOUND,
            Error::Backpressure => codes::BACKPRESSURE,
            Error::HandlerFailed(_) => codes::HANDLER_FAILED,
            Error::Timeout => codes::TIMEOUT,
            Error::TransportFailed { .. } => codes::TRANSPORT_FAILED,
            Error::Internal => codes::INTERNAL,
        }
    }

    /// Renders this fault as the `DGResponse` a caller actually observes.
    pub fn to_response(&self, request_id: impl Into<String>) -> DGResponse {
        if matches!(self, Error::Timeout) {
            return DGResponse::timeout(request_id);
        }
        DGResponse::error(request_id, self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
