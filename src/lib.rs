//! Mediafetch Core Library
//!
//! Resilient transport and concurrent download pipeline for pulling media
//! from a rate-limited, authenticated HTTP API onto local storage.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`transport`] - rate limiter, adaptive sleeper, retry executor and the
//!   reqwest-backed session
//! - [`download`] - items, per-item handlers, the worker-pool orchestrator
//!   and progress tracking
//! - [`collab`] - interfaces to external collaborators (cache, decrypter,
//!   script hooks)

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod collab;
pub mod download;
pub mod transport;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use download::{
    BatchResult, DownloadError, DownloadItem, ErrorCategory, ItemStatus, NormalHandler,
    NormalHandlerConfig, Orchestrator, OrchestratorConfig, OrchestratorError, ProgressTracker,
    ProgressUpdate, ProtectedHandler,
};
pub use transport::{
    AdaptiveSleeper, Auth, RateLimiter, RetryConfig, RetryExecutor, SessionConfig, SessionManager,
    Transport, TransportError,
};
