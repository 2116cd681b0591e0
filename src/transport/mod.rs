//! Resilient HTTP transport.
//!
//! Layers, from the wire up:
//!
//! - [`SessionManager`] - pooled reqwest client with swappable [`Auth`];
//!   applies the [`RateLimiter`] and [`AdaptiveSleeper`] before every call
//!   and feeds the sleeper from 429/504/403 responses
//! - [`RetryExecutor`] - classifies each outcome and retries transient ones
//!   with exponential backoff
//!
//! Everything above the transport talks to the [`Transport`] trait, so the
//! download pipeline can run against a scripted transport in tests.

pub mod constants;
mod error;
mod rate_limiter;
mod request;
mod retry;
mod session;
mod sleeper;

pub use error::{NetworkErrorKind, TransportError};
pub use rate_limiter::RateLimiter;
pub use request::{BodyStream, RequestSpec, Response};
pub use retry::{
    Classification, DEFAULT_MAX_ATTEMPTS, RetryConfig, RetryExecutor, RetryOutcome, classify,
    classify_error, classify_status, parse_retry_after,
};
pub use session::{Auth, DEFAULT_USER_AGENT, SessionConfig, SessionManager, Transport};
pub use sleeper::{AdaptiveSleeper, SleeperConfig};
