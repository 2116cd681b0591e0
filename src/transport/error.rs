//! Error types for the transport layer.
//!
//! Every variant carries the request URL (where one exists) so the batch
//! report can point at the failing call without extra bookkeeping.

use std::error::Error as _;
use std::io;

use thiserror::Error;

/// Low-level network failure kinds that matter for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkErrorKind {
    /// Connect or read deadline elapsed.
    Timeout,
    /// Peer reset the connection.
    ConnectionReset,
    /// Peer refused the connection.
    ConnectionRefused,
    /// Write to a closed socket.
    BrokenPipe,
    /// Stream ended before the message was complete.
    UnexpectedEof,
    /// Anything else (TLS, DNS, protocol, redirect loops).
    Other,
}

impl NetworkErrorKind {
    /// Maps an I/O error kind onto a network failure kind.
    #[must_use]
    pub fn from_io(kind: io::ErrorKind) -> Self {
        match kind {
            io::ErrorKind::TimedOut => Self::Timeout,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Self::ConnectionReset
            }
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused,
            io::ErrorKind::BrokenPipe => Self::BrokenPipe,
            io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
            _ => Self::Other,
        }
    }

    /// Returns true for the transient kinds that are worth another attempt.
    #[must_use]
    pub fn is_transient(self) -> bool {
        !matches!(self, Self::Other)
    }
}

/// Errors produced by the transport, rate limiter, sleeper and retry executor.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The cancellation token fired while waiting or transferring.
    #[error("operation cancelled")]
    Cancelled,

    /// Network-level error from the HTTP client.
    #[error("network error ({kind:?}) requesting {url}: {source}")]
    Network {
        /// The URL that failed.
        url: String,
        /// Classified failure kind.
        kind: NetworkErrorKind,
        /// The underlying client error.
        #[source]
        source: reqwest::Error,
    },

    /// I/O error surfaced while reading a response body.
    #[error("I/O error reading {url}: {source}")]
    Io {
        /// The URL whose body failed.
        url: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// Retryable HTTP status recorded as the last cause inside the retry loop.
    #[error("HTTP {status} requesting {url}")]
    HttpStatus {
        /// The URL that returned the status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// Raw Retry-After header, when present.
        retry_after: Option<String>,
    },

    /// The request could not be built (malformed URL, bad header value).
    #[error("invalid request for {url}: {reason}")]
    InvalidRequest {
        /// The offending URL.
        url: String,
        /// Why the request was rejected.
        reason: String,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),

    /// The session was closed; no further requests are accepted.
    #[error("session closed")]
    Closed,

    /// The response body could not be decoded.
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        /// The URL whose body was malformed.
        url: String,
        /// The decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// All attempts were used up; carries the last recorded cause.
    #[error("max retries exceeded after {attempts} attempts: {source}")]
    MaxRetriesExceeded {
        /// Number of attempts made.
        attempts: u32,
        /// The last recorded cause.
        #[source]
        source: Box<TransportError>,
    },
}

impl TransportError {
    /// Creates a network error, classifying the underlying failure kind.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        let kind = classify_reqwest_error(&source);
        Self::Network {
            url: url.into(),
            kind,
            source,
        }
    }

    /// Creates a body I/O error.
    pub fn io(url: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16, retry_after: Option<String>) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates an invalid request error.
    pub fn invalid_request(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Creates a decode error.
    pub fn decode(url: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Decode {
            url: url.into(),
            source,
        }
    }

    /// Wraps the last cause after the retry budget is spent.
    pub fn max_retries(attempts: u32, last: TransportError) -> Self {
        Self::MaxRetriesExceeded {
            attempts,
            source: Box::new(last),
        }
    }

    /// Returns true if this error (or its wrapped cause) is a cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled => true,
            Self::MaxRetriesExceeded { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Returns the HTTP status behind this error, looking through retry wrapping.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Network { source, .. } => source.status().map(|s| s.as_u16()),
            Self::MaxRetriesExceeded { source, .. } => source.status(),
            _ => None,
        }
    }
}

/// Derives the network failure kind from a reqwest error and its source chain.
fn classify_reqwest_error(error: &reqwest::Error) -> NetworkErrorKind {
    if error.is_timeout() {
        return NetworkErrorKind::Timeout;
    }

    if let Some(kind) = io_kind_in_chain(error) {
        return kind;
    }

    // DNS and TLS failures also surface as connect errors; they stay Other.
    if error.is_connect() {
        return NetworkErrorKind::Other;
    }

    // hyper reports a truncated message without an io::Error in the chain
    let message = error.to_string().to_lowercase();
    if message.contains("connection closed before message completed")
        || message.contains("unexpected eof")
        || message.contains("incomplete message")
    {
        return NetworkErrorKind::UnexpectedEof;
    }

    NetworkErrorKind::Other
}

/// First transient I/O kind found walking the source chain.
fn io_kind_in_chain(error: &(dyn std::error::Error + 'static)) -> Option<NetworkErrorKind> {
    let mut source = error.source();
    while let Some(cause) = source {
        if let Some(io_error) = cause.downcast_ref::<io::Error>() {
            let kind = NetworkErrorKind::from_io(io_error.kind());
            if kind != NetworkErrorKind::Other {
                return Some(kind);
            }
        }
        source = cause.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_kind_from_io_maps_transient_kinds() {
        assert_eq!(
            NetworkErrorKind::from_io(io::ErrorKind::ConnectionReset),
            NetworkErrorKind::ConnectionReset
        );
        assert_eq!(
            NetworkErrorKind::from_io(io::ErrorKind::ConnectionRefused),
            NetworkErrorKind::ConnectionRefused
        );
        assert_eq!(
            NetworkErrorKind::from_io(io::ErrorKind::BrokenPipe),
            NetworkErrorKind::BrokenPipe
        );
        assert_eq!(
            NetworkErrorKind::from_io(io::ErrorKind::UnexpectedEof),
            NetworkErrorKind::UnexpectedEof
        );
        assert_eq!(
            NetworkErrorKind::from_io(io::ErrorKind::TimedOut),
            NetworkErrorKind::Timeout
        );
        assert_eq!(
            NetworkErrorKind::from_io(io::ErrorKind::PermissionDenied),
            NetworkErrorKind::Other
        );
    }

    #[derive(Debug)]
    struct Wrapped(io::Error);

    impl std::fmt::Display for Wrapped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "connect failed")
        }
    }

    impl std::error::Error for Wrapped {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            Some(&self.0)
        }
    }

    #[test]
    fn test_io_kind_in_chain_finds_refused_connection() {
        let error = Wrapped(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert_eq!(
            io_kind_in_chain(&error),
            Some(NetworkErrorKind::ConnectionRefused)
        );
    }

    #[test]
    fn test_io_kind_in_chain_ignores_resolution_failures() {
        let error = Wrapped(io::Error::other("failed to lookup address information"));
        assert_eq!(io_kind_in_chain(&error), None);
        assert!(!NetworkErrorKind::Other.is_transient());
    }

    #[test]
    fn test_http_status_display_includes_url_and_status() {
        let error = TransportError::http_status("https://api.example.com/media/1", 503, None);
        let msg = error.to_string();
        assert!(msg.contains("503"), "Expected status in: {msg}");
        assert!(msg.contains("https://api.example.com/media/1"));
    }

    #[test]
    fn test_max_retries_wraps_last_cause() {
        let last = TransportError::http_status("https://api.example.com/x", 500, None);
        let error = TransportError::max_retries(3, last);
        let msg = error.to_string();
        assert!(msg.contains("max retries exceeded"), "got: {msg}");
        assert!(msg.contains("500"), "got: {msg}");
        assert_eq!(error.status(), Some(500));
    }

    #[test]
    fn test_is_cancelled_looks_through_wrapping() {
        assert!(TransportError::Cancelled.is_cancelled());
        assert!(TransportError::max_retries(2, TransportError::Cancelled).is_cancelled());
        assert!(!TransportError::invalid_request("x", "bad").is_cancelled());
    }
}
