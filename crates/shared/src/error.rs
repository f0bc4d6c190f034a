//! Shared error types.

use serde::Deserialize;
use thiserror::Error;

/// Errors raised by the expense sync client.
///
/// `Clone` so a single refresh outcome can be handed to every caller that
/// joined the same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Missing, invalid or expired credentials; needs a fresh login.
    #[error("authentication error: {0}")]
    Auth(String),

    /// Socket or HTTP transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed inbound frame or unencodable outbound payload.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The reconnect budget ran out.
    #[error("connection lost after {attempts} reconnect attempts")]
    ExhaustedRetries { attempts: u32 },

    /// The server answered with an `{"error": ...}` frame.
    #[error("server error: {0}")]
    Server(String),

    /// Another attachment upload is still waiting for its response.
    #[error("an attachment upload is already in flight on this connection")]
    UploadInFlight,
}

impl SyncError {
    pub fn is_auth(&self) -> bool {
        matches!(self, SyncError::Auth(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// HTTP API error for the REST side of the client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Deserialization error: {0}")]
    Deserialize(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
}

/// Error body returned by the backend (`{"detail": "...", "code": "..."}`).
#[derive(Debug, Deserialize)]
struct ErrorBody {
    detail: Option<String>,
    code: Option<String>,
}

/// Attempt to parse a JSON error body into a user-facing message.
/// Prefers `detail`, falls back to `code`.
pub fn try_error_detail(body: &str) -> Option<String> {
    let parsed = serde_json::from_str::<ErrorBody>(body).ok()?;
    if let Some(detail) = parsed.detail {
        if !detail.trim().is_empty() {
            return Some(detail);
        }
    }
    parsed.code.filter(|code| !code.trim().is_empty())
}
