// Error taxonomy shared by the library. Every error is `Clone` so a single
// re-authentication result can be handed to several waiting callers; I/O
// failures are therefore captured as messages, not as `std::io::Error`.

use thiserror::Error;

use crate::retry::{classify_status, Disposition};

/// `code` reported when the server answer does not match the expected shape.
pub const PROTOCOL_MISMATCH: &str = "ProtocolMismatch";

/// Error reported by the remote service, surfaced verbatim.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{code}: {message}{}", request_suffix(.status, .request_id))]
pub struct ApiError {
    /// HTTP status, absent for protocol-level mismatches.
    pub status: Option<u16>,
    pub code: String,
    pub message: String,
    pub request_id: Option<String>,
}

fn request_suffix(status: &Option<u16>, request_id: &Option<String>) -> String {
    match (status, request_id) {
        (Some(s), Some(id)) => format!(" (HTTP {}, request {})", s, id),
        (Some(s), None) => format!(" (HTTP {})", s),
        (None, Some(id)) => format!(" (request {})", id),
        (None, None) => String::new(),
    }
}

impl ApiError {
    pub fn from_status(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError {
            status: Some(status),
            code: code.into(),
            message: message.into(),
            request_id: None,
        }
    }

    /// The server answered, but not with what the protocol promises.
    pub fn protocol_mismatch(message: impl Into<String>) -> Self {
        ApiError {
            status: None,
            code: PROTOCOL_MISMATCH.into(),
            message: message.into(),
            request_id: None,
        }
    }

    /// 500/502/503/504 are worth another attempt.
    pub fn is_transient(&self) -> bool {
        self.status.map(classify_status) == Some(Disposition::TransientRetryable)
    }

    /// A 401 means the access token is no longer accepted.
    pub fn is_invalid_token(&self) -> bool {
        self.status == Some(401)
    }

    pub fn is_protocol_mismatch(&self) -> bool {
        self.code == PROTOCOL_MISMATCH
    }
}

/// Failure of a single request against the service or the object store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// Connection-level failure (DNS, reset, timeout, closed stream).
    #[error("network error: {0}")]
    Network(String),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ClientError {
    pub fn is_invalid_token(&self) -> bool {
        matches!(self, ClientError::Api(e) if e.is_invalid_token())
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ClientError::Api(ApiError::from_status(
                status.as_u16(),
                status.canonical_reason().unwrap_or("HttpError"),
                err.to_string(),
            ));
        }
        if err.is_decode() {
            return ClientError::Api(ApiError::protocol_mismatch(err.to_string()));
        }
        ClientError::Network(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match err {
            WsError::Http(response) => {
                let status = response.status();
                ClientError::Api(ApiError::from_status(
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("HttpError"),
                    "event stream handshake rejected",
                ))
            }
            other => ClientError::Network(other.to_string()),
        }
    }
}

/// Input rejected before any network call is made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("file of {size} bytes needs {parts} parts, the service accepts at most {max_parts}")]
    FileTooLarge { size: u64, parts: u64, max_parts: u64 },

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },
}

/// Failures of the persisted session record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session file {path}: {message}")]
    Io { path: String, message: String },

    #[error("session file {path} is not valid JSON: {message}")]
    Json { path: String, message: String },
}

/// Terminal failures of the QR authentication handshake.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Deadline elapsed or the caller cancelled.
    #[error("authentication timed out")]
    Timeout,

    #[error("QR challenge {uuid:?} has an invalid signature")]
    InvalidSignature { uuid: String },

    #[error("QR challenge expired and could not be refreshed: {cause}")]
    ChallengeExpiredNoRefresh { cause: ClientError },

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Failures of a multipart upload.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("I/O error for {path}: {message}")]
    Io { path: String, message: String },

    /// Initiate or confirm failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(
        "part {part_number} failed after {completed_parts} of {total_parts} parts \
         ({bytes_sent} bytes) were uploaded: {cause}"
    )]
    PartFailed {
        part_number: u32,
        cause: ClientError,
        completed_parts: u32,
        total_parts: u32,
        /// Highest part number below which every part completed.
        last_completed_part: Option<u32>,
        bytes_sent: u64,
    },

    #[error("upload cancelled after {completed_parts} of {total_parts} parts")]
    Cancelled {
        completed_parts: u32,
        total_parts: u32,
        bytes_sent: u64,
    },
}

impl UploadError {
    pub fn is_invalid_token(&self) -> bool {
        matches!(self, UploadError::Client(e) if e.is_invalid_token())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_error_display_keeps_server_fields() {
        let mut err = ApiError::from_status(403, "Forbidden", "quota exceeded");
        err.request_id = Some("req-42".into());
        assert_eq!(
            err.to_string(),
            "Forbidden: quota exceeded (HTTP 403, request req-42)"
        );
    }

    #[test]
    fn only_gateway_class_statuses_are_transient() {
        for status in [500, 502, 503, 504] {
            assert!(ApiError::from_status(status, "x", "y").is_transient());
        }
        for status in [400, 401, 404, 501] {
            assert!(!ApiError::from_status(status, "x", "y").is_transient());
        }
        assert!(!ApiError::protocol_mismatch("short").is_transient());
    }

    #[test]
    fn invalid_token_is_detected_through_wrappers() {
        let api = ApiError::from_status(401, "InvalidToken", "expired");
        let upload = UploadError::Client(ClientError::Api(api));
        assert!(upload.is_invalid_token());
        assert!(!UploadError::Client(ClientError::Network("reset".into())).is_invalid_token());
    }
}
