/*!
 * Error types for Cumulus
 */

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::net::api::ApiError;
use crate::net::http::HttpError;

pub type Result<T> = std::result::Result<T, TransferError>;

/// Exit code constants for structured process exit
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_PARTIAL: i32 = 1;
pub const EXIT_FATAL: i32 = 2;
pub const EXIT_INTEGRITY: i32 = 3;

/// Everything that can end or interrupt a transfer.
///
/// Cloneable so a single failure can be handed to every waiter of a
/// transfer and to the event stream at once.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransferError {
    /// Connection-level failure (reset, refused, DNS)
    #[error("network error: {0}")]
    Network(String),

    /// Request or stream stalled past its deadline
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// Non-success HTTP status from a storage host
    #[error("HTTP status {status}")]
    Http { status: u16 },

    /// Transfer quota exhausted on the backend
    #[error("transfer quota exceeded")]
    Overquota { retry_after: Option<Duration> },

    /// Condensed MAC did not match the file key
    #[error("integrity check failed: {0}")]
    Integrity(String),

    /// The file or link is no longer accessible
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The node does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend asked us to slow down
    #[error("too many requests")]
    TooManyRequests,

    /// Local read or write failure
    #[error("local I/O error: {0}")]
    LocalIo(String),

    /// A response we could not interpret
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Parity reconstruction could not complete
    #[error("CloudRAID reassembly failed: {0}")]
    Raid(String),

    /// Retry ceiling reached
    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    /// Other backend API error code
    #[error("backend error {code}")]
    Api { code: i64 },

    /// Invalid key or configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Resume state could not be read or written
    #[error("resume state error: {0}")]
    Resume(String),

    /// The transfer was cancelled by the user
    #[error("transfer cancelled")]
    Cancelled,
}

/// Coarse classification that drives recovery policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Retry with backoff
    TransientNetwork,
    /// Pause the queue until quota is available
    Overquota,
    /// Data does not match its MAC
    Integrity,
    /// Abort the transfer immediately
    Fatal,
    /// Local storage trouble, retried before falling back
    LocalIo,
    /// User-initiated, never surfaced as an error
    Cancelled,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::TransientNetwork => write!(f, "transient-network"),
            ErrorCategory::Overquota => write!(f, "overquota"),
            ErrorCategory::Integrity => write!(f, "integrity"),
            ErrorCategory::Fatal => write!(f, "fatal"),
            ErrorCategory::LocalIo => write!(f, "local-io"),
            ErrorCategory::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl TransferError {
    /// Get the process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Integrity => EXIT_INTEGRITY,
            ErrorCategory::Fatal => EXIT_FATAL,
            _ => EXIT_PARTIAL,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            TransferError::Network(_)
            | TransferError::Timeout(_)
            | TransferError::Malformed(_)
            | TransferError::Raid(_) => ErrorCategory::TransientNetwork,
            TransferError::Http { status } => match status {
                509 => ErrorCategory::Overquota,
                400 | 401 | 410 => ErrorCategory::Fatal,
                _ => ErrorCategory::TransientNetwork,
            },
            TransferError::Api { code } => match code {
                -3 | -4 | -18 => ErrorCategory::TransientNetwork,
                _ => ErrorCategory::Fatal,
            },
            TransferError::Overquota { .. } => ErrorCategory::Overquota,
            TransferError::Integrity(_) => ErrorCategory::Integrity,
            TransferError::AccessDenied(_)
            | TransferError::NotFound(_)
            | TransferError::TooManyRequests
            | TransferError::RetriesExhausted { .. }
            | TransferError::Config(_) => ErrorCategory::Fatal,
            TransferError::LocalIo(_) | TransferError::Resume(_) => ErrorCategory::LocalIo,
            TransferError::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Check if the failed operation is worth repeating after a delay
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::TransientNetwork | ErrorCategory::LocalIo
        )
    }

    /// Check if this error is fatal (should not retry)
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Fatal | ErrorCategory::Integrity
        )
    }

    /// Only integrity and access-class failures reach the user; transient
    /// trouble is retried quietly.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Integrity | ErrorCategory::Fatal
        )
    }

    /// Wait the backend asked for, if this is an overquota refusal
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransferError::Overquota { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Status codes that mean the chunk URLs went stale.
    pub fn is_stale_url(&self) -> bool {
        matches!(self, TransferError::Http { status: 403 | 404 })
    }
}

impl From<io::Error> for TransferError {
    fn from(err: io::Error) -> Self {
        TransferError::LocalIo(err.to_string())
    }
}

impl From<HttpError> for TransferError {
    fn from(err: HttpError) -> Self {
        match err {
            HttpError::Status(509) => TransferError::Overquota { retry_after: None },
            HttpError::Status(status) => TransferError::Http { status },
            HttpError::Timeout(after) => TransferError::Timeout(after),
            HttpError::Network(msg) => TransferError::Network(msg),
            HttpError::Body(msg) => TransferError::Network(msg),
            HttpError::InvalidUrl(msg) => TransferError::Config(msg),
        }
    }
}

impl From<ApiError> for TransferError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Overquota { retry_after } => TransferError::Overquota { retry_after },
            ApiError::NotFound => TransferError::NotFound("node".to_string()),
            ApiError::AccessDenied(reason) => TransferError::AccessDenied(reason),
            ApiError::TooMany => TransferError::TooManyRequests,
            ApiError::Transient(code) => TransferError::Api { code },
            ApiError::Unsupported(what) => TransferError::Config(what),
            ApiError::Transport(http) => http.into(),
            ApiError::Other(code) => TransferError::Api { code },
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        TransferError::Resume(err.to_string())
    }
}
