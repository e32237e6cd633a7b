//! Error types for the client crate.

use std::fmt;

use protocol::{ProtocolError, StructValue};

/// Which service raised an in-band error, chosen from the request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceErrorKind {
    /// Messaging service (`/S4`, `TalkService`, ...).
    Talk,
    /// Group-chat service (`/SQ1`).
    Square,
    /// Any other path.
    Internal,
}

impl ServiceErrorKind {
    /// Classifies a request path.
    pub fn from_path(path: &str) -> Self {
        if path.contains("/SQ") {
            ServiceErrorKind::Square
        } else if path.contains("/S") || path.contains("TalkService") {
            ServiceErrorKind::Talk
        } else {
            ServiceErrorKind::Internal
        }
    }
}

impl fmt::Display for ServiceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ServiceErrorKind::Talk => "talk",
            ServiceErrorKind::Square => "square",
            ServiceErrorKind::Internal => "internal",
        })
    }
}

/// An error payload returned in the error slot of a reply.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceError {
    pub kind: ServiceErrorKind,
    /// Numeric error code, when the server sent one.
    pub code: Option<i32>,
    pub message: String,
    /// The raw error struct.
    pub detail: StructValue,
}

impl ServiceError {
    /// Builds a service error from the decoded error struct.
    pub fn from_struct(kind: ServiceErrorKind, detail: StructValue) -> Self {
        let code = detail.i32(1);
        let message = detail
            .str(2)
            .map(str::to_string)
            .or_else(|| detail.str(1).map(str::to_string))
            .unwrap_or_default();
        Self {
            kind,
            code,
            message,
            detail,
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} service error {}: {}", self.kind, code, self.message),
            None => write!(f, "{} service error: {}", self.kind, self.message),
        }
    }
}

/// Errors that can occur in the client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The request did not complete within its timeout.
    #[error("request timed out: {0}")]
    TransportTimeout(String),

    /// Connecting to or talking with the server failed.
    #[error("connection error: {0}")]
    TransportConnection(String),

    /// The server answered with a non-success HTTP status.
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Malformed or truncated wire data.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// In-band service error.
    #[error("{0}")]
    Service(ServiceError),

    /// The peer does not support the negotiated E2EE version.
    #[error("E2EE not supported by {mid}")]
    E2eeUnsupported { mid: String },

    /// The peer's current key id differs from the one requested.
    #[error("E2EE key mismatch for {mid}: requested {requested}, current {current}")]
    E2eeKeyMismatch {
        mid: String,
        requested: i32,
        current: i32,
    },

    /// A message could not be decrypted.
    #[error("E2EE decryption failed: {0}")]
    E2eeDecryption(String),

    /// No local E2EE key is available.
    #[error("no E2EE key available")]
    NoE2eeKey,

    /// The operation needs an access token.
    #[error("not logged in")]
    NotLoggedIn,

    /// No refresh token is stored.
    #[error("refresh token missing")]
    RefreshTokenMissing,

    /// A response did not have the expected shape.
    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The credential store failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The operation was cancelled by shutdown.
    #[error("operation cancelled")]
    Cancelled,
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Keywords marking an error message as a transient network condition.
const TRANSIENT_KEYWORDS: &[&str] = &["timeout", "timed out", "connection", "network", "reset", "refused"];

impl ClientError {
    /// Service error code, if this is a service error carrying one.
    pub fn service_code(&self) -> Option<i32> {
        match self {
            ClientError::Service(e) => e.code,
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&ServiceError> {
        match self {
            ClientError::Service(e) => Some(e),
            _ => None,
        }
    }

    /// True for failures worth retrying with exponential backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::TransportTimeout(_) | ClientError::TransportConnection(_) => true,
            ClientError::Cancelled => false,
            other => {
                let text = other.to_string().to_lowercase();
                TRANSIENT_KEYWORDS.iter().any(|k| text.contains(k))
            }
        }
    }

    /// True if the server asked for the access token to be refreshed.
    pub fn is_refresh_required(&self) -> bool {
        match self {
            ClientError::Service(e) => {
                e.code == Some(crate::transport::MUST_REFRESH_CODE)
                    || e.message.contains(crate::transport::MUST_REFRESH_TEXT)
                    || e.detail.str(1) == Some(crate::transport::MUST_REFRESH_TEXT)
            }
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::TransportTimeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() || err.is_decode() {
            ClientError::TransportConnection(err.to_string())
        } else if let Some(status) = err.status() {
            ClientError::HttpStatus {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            ClientError::TransportConnection(err.to_string())
        }
    }
}
