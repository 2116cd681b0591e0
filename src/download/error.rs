//! Error types for the download pipeline.
//!
//! [`DownloadError`] is always per-item: the orchestrator records it in the
//! batch result and moves on. [`OrchestratorError`] is reserved for failures
//! that make the whole batch impossible.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::collab::BoxError;
use crate::transport::TransportError;

/// Per-item download failure.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The item has no resolved destination path.
    #[error("item {item_id} has no destination path")]
    MissingDestination {
        /// The item id.
        item_id: u64,
    },

    /// Protected item but no enabled decrypter is configured.
    #[error("item {item_id} is protected but {reason}")]
    DecrypterUnavailable {
        /// The item id.
        item_id: u64,
        /// Why the decrypter cannot be used.
        reason: &'static str,
    },

    /// The server answered with a status the handler cannot use.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL requested.
        url: String,
        /// The HTTP status code.
        status: u16,
    },

    /// Transport failure (network, retries exhausted, invalid request).
    #[error("transfer failed: {0}")]
    Transport(#[source] TransportError),

    /// Local filesystem failure.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Committed size does not match what the server announced.
    #[error("integrity check failed for {path}: expected {expected} bytes, got {actual}")]
    Integrity {
        /// The temporary file that failed verification.
        path: PathBuf,
        /// Announced size.
        expected: u64,
        /// Size on disk.
        actual: u64,
    },

    /// The decrypt collaborator failed.
    #[error("decrypt failed for item {item_id}: {source}")]
    Decrypt {
        /// The item id.
        item_id: u64,
        /// Collaborator error, passed through verbatim.
        #[source]
        source: BoxError,
    },

    /// The batch was cancelled while this item was in flight.
    #[error("download cancelled")]
    Cancelled,

    /// The handler panicked.
    #[error("download task panicked: {message}")]
    Panicked {
        /// Panic payload, when it was a string.
        message: String,
    },
}

impl DownloadError {
    /// Wraps a transport error; cancellation is kept distinct.
    pub fn transport(source: TransportError) -> Self {
        if source.is_cancelled() {
            Self::Cancelled
        } else {
            Self::Transport(source)
        }
    }

    /// Creates a filesystem error.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
        }
    }

    /// Builds a panic error from a `catch_unwind` payload.
    pub fn panicked(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        Self::Panicked { message }
    }

    /// Maps this error onto the failure taxonomy.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::MissingDestination { .. } | Self::DecrypterUnavailable { .. } => {
                ErrorCategory::Configuration
            }
            Self::HttpStatus { status, .. } => ErrorCategory::from_status(*status),
            Self::Transport(source) => ErrorCategory::from_transport(source),
            Self::Io { .. } => ErrorCategory::Filesystem,
            Self::Integrity { .. } => ErrorCategory::TransientNetwork,
            Self::Decrypt { .. } => ErrorCategory::Collaborator,
            Self::Cancelled => ErrorCategory::Cancellation,
            Self::Panicked { .. } => ErrorCategory::Internal,
        }
    }
}

/// Failure taxonomy used for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Missing path or decrypter. Never retried.
    Configuration,
    /// Timeout, reset, refused, broken pipe, truncated body.
    TransientNetwork,
    /// 429 or 504.
    Throttling,
    /// 403.
    Forbidden,
    /// 400 or 401.
    Auth,
    /// 404 or 410.
    NotFound,
    /// Other 5xx.
    Server,
    /// Malformed response body.
    Decode,
    /// Directory creation, open, write or rename.
    Filesystem,
    /// Cancelled by the caller.
    Cancellation,
    /// Decrypter failure.
    Collaborator,
    /// Panic or other bug.
    Internal,
}

impl ErrorCategory {
    /// Category for an HTTP status.
    #[must_use]
    pub fn from_status(status: u16) -> Self {
        match status {
            429 | 504 => Self::Throttling,
            403 => Self::Forbidden,
            400 | 401 | 407 => Self::Auth,
            404 | 410 => Self::NotFound,
            500..=599 => Self::Server,
            _ => Self::Configuration,
        }
    }

    /// Category for a transport error, looking through retry wrapping.
    #[must_use]
    pub fn from_transport(error: &TransportError) -> Self {
        match error {
            TransportError::Cancelled => Self::Cancellation,
            TransportError::Network { .. } | TransportError::Io { .. } => Self::TransientNetwork,
            TransportError::HttpStatus { status, .. } => Self::from_status(*status),
            TransportError::Decode { .. } => Self::Decode,
            TransportError::InvalidRequest { .. }
            | TransportError::ClientBuild(_)
            | TransportError::Closed => Self::Configuration,
            TransportError::MaxRetriesExceeded { source, .. } => Self::from_transport(source),
        }
    }

    /// Short label for summaries.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::TransientNetwork => "network",
            Self::Throttling => "throttled",
            Self::Forbidden => "forbidden",
            Self::Auth => "auth",
            Self::NotFound => "not found",
            Self::Server => "server",
            Self::Decode => "decode",
            Self::Filesystem => "filesystem",
            Self::Cancellation => "cancelled",
            Self::Collaborator => "collaborator",
            Self::Internal => "internal",
        }
    }
}

/// Batch-fatal orchestrator failure.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The output root directory could not be created.
    #[error("cannot create output directory {path}: {source}")]
    OutputRoot {
        /// The directory.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
}
