//! Classification-driven retry with exponential backoff.
//!
//! Each outcome of a single transport call is classified by a pure function
//! of (status, error):
//!
//! | Outcome | Classification | Executor action |
//! |---------|----------------|-----------------|
//! | 2xx | `Success` | return the response |
//! | 429, 504, other 5xx | `RetryableResponse` | release body, back off, retry |
//! | any other status (400, 401, 403, 404, ...) | `NonRetryableResponse` | return the response for the caller to interpret |
//! | timeout, reset, refused, broken pipe, EOF | `RetryableTransportError` | back off, retry |
//! | anything else (cancelled, invalid request, decode) | `TerminalTransportError` | return the error |
//!
//! Backoff waits start at `min_wait` and grow by `multiplier` up to
//! `max_wait`. A `Retry-After` header can stretch a single wait (never past
//! `max_wait`).
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use mediafetch_core::transport::RetryConfig;
//!
//! let config = RetryConfig::new(8, Duration::from_secs(1), Duration::from_secs(30), 2.0);
//! let waits: Vec<u64> = config.waits().take(7).map(|w| w.as_secs()).collect();
//! assert_eq!(waits, vec![1, 2, 4, 8, 16, 30, 30]);
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use super::constants::MAX_RETRY_AFTER;
use super::{RequestSpec, Response, Transport, TransportError};
use crate::collab::Cache;

/// Default maximum attempts (including the first).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default first backoff wait.
const DEFAULT_MIN_WAIT: Duration = Duration::from_secs(1);

/// Default backoff cap.
const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(30);

/// Default backoff multiplier.
const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Immutable retry settings for one call site.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryConfig {
    max_attempts: u32,
    min_wait: Duration,
    max_wait: Duration,
    multiplier: f64,
    jitter: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_wait: DEFAULT_MIN_WAIT,
            max_wait: DEFAULT_MAX_WAIT,
            multiplier: DEFAULT_MULTIPLIER,
            jitter: Duration::ZERO,
        }
    }
}

impl RetryConfig {
    /// Creates a retry config; `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(max_attempts: u32, min_wait: Duration, max_wait: Duration, multiplier: f64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            min_wait,
            max_wait: max_wait.max(min_wait),
            multiplier,
            jitter: Duration::ZERO,
        }
    }

    /// Default config with a custom attempt budget.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Adds up to `max` of uniform random jitter to every wait.
    #[must_use]
    pub fn with_jitter(mut self, max: Duration) -> Self {
        self.jitter = max;
        self
    }

    /// Maximum attempts, including the first.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// First backoff wait.
    #[must_use]
    pub fn min_wait(&self) -> Duration {
        self.min_wait
    }

    /// Backoff cap.
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    /// Backoff multiplier.
    #[must_use]
    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Jitter bound.
    #[must_use]
    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    /// `min(max_wait, wait * multiplier)`.
    #[must_use]
    pub fn next_wait(&self, wait: Duration) -> Duration {
        Duration::try_from_secs_f64(wait.as_secs_f64() * self.multiplier)
            .unwrap_or(self.max_wait)
            .min(self.max_wait)
    }

    /// Endless iterator over the jitter-free wait sequence.
    pub fn waits(&self) -> impl Iterator<Item = Duration> + '_ {
        std::iter::successors(Some(self.min_wait.min(self.max_wait)), |wait| {
            Some(self.next_wait(*wait))
        })
    }

    fn jittered(&self, wait: Duration) -> Duration {
        if self.jitter.is_zero() {
            return wait;
        }
        let max_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = rand::thread_rng().gen_range(0..=max_ms);
        wait + Duration::from_millis(jitter_ms)
    }
}

/// Outcome class of one transport call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// 2xx.
    Success,
    /// A status the caller must interpret (auth, not found, forbidden).
    NonRetryableResponse,
    /// Throttling or server error.
    RetryableResponse,
    /// Transient network failure.
    RetryableTransportError,
    /// Anything that another attempt will not fix.
    TerminalTransportError,
}

impl Classification {
    /// Returns true for the two retryable classes.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::RetryableResponse | Self::RetryableTransportError)
    }
}

/// Classifies an HTTP status.
#[must_use]
pub fn classify_status(status: u16) -> Classification {
    match status {
        200..=299 => Classification::Success,
        429 | 500..=599 => Classification::RetryableResponse,
        _ => Classification::NonRetryableResponse,
    }
}

/// Classifies a transport error.
#[must_use]
pub fn classify_error(error: &TransportError) -> Classification {
    let transient = match error {
        TransportError::Network { kind, .. } => kind.is_transient(),
        TransportError::Io { source, .. } => {
            super::NetworkErrorKind::from_io(source.kind()).is_transient()
        }
        TransportError::HttpStatus { status, .. } => classify_status(*status).is_retryable(),
        TransportError::Cancelled
        | TransportError::InvalidRequest { .. }
        | TransportError::ClientBuild(_)
        | TransportError::Closed
        | TransportError::Decode { .. }
        | TransportError::MaxRetriesExceeded { .. } => false,
    };
    if transient {
        Classification::RetryableTransportError
    } else {
        Classification::TerminalTransportError
    }
}

/// Classifies the result of one transport call.
#[must_use]
pub fn classify(result: &Result<Response, TransportError>) -> Classification {
    match result {
        Ok(response) => classify_status(response.status_code()),
        Err(error) => classify_error(error),
    }
}

/// Non-error result of [`RetryExecutor::execute`].
#[derive(Debug)]
pub enum RetryOutcome {
    /// 2xx response.
    Success(Response),
    /// A response the retry layer does not interpret (401, 403, 404, ...).
    NonRetriable(Response),
}

impl RetryOutcome {
    /// Returns true for a 2xx response.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The response, whichever way it was classified.
    #[must_use]
    pub fn into_response(self) -> Response {
        match self {
            Self::Success(response) | Self::NonRetriable(response) => response,
        }
    }
}

/// Runs requests through a [`Transport`] with classification-driven retry.
pub struct RetryExecutor {
    transport: Arc<dyn Transport>,
    retries: AtomicU64,
}

impl std::fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("retries", &self.retries())
            .finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Creates an executor over `transport`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            retries: AtomicU64::new(0),
        }
    }

    /// The wrapped transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Total retries (extra attempts) performed by this executor.
    #[must_use]
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Sends `spec`, retrying retryable outcomes up to `config.max_attempts()`.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Cancelled`] if `cancel` fires before or between attempts
    /// - the terminal error itself for non-retryable transport failures
    /// - [`TransportError::MaxRetriesExceeded`] carrying the last cause once the
    ///   attempt budget is spent
    #[instrument(skip(self, cancel, spec, config), fields(url = %spec.url, max_attempts = config.max_attempts()))]
    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        spec: &RequestSpec,
        config: &RetryConfig,
    ) -> Result<RetryOutcome, TransportError> {
        let mut wait = config.min_wait();
        let mut attempt = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }

            let result = self.transport.send(cancel, spec).await;
            let mut retry_after = None;
            let error = match result {
                Ok(response) => match classify_status(response.status_code()) {
                    Classification::Success => return Ok(RetryOutcome::Success(response)),
                    Classification::RetryableResponse => {
                        let header = response.retry_after();
                        retry_after = header.as_deref().and_then(parse_retry_after);
                        let error = TransportError::http_status(
                            response.url(),
                            response.status_code(),
                            header,
                        );
                        response.discard();
                        error
                    }
                    _ => {
                        debug!(attempt, status = response.status_code(), "non-retryable response");
                        return Ok(RetryOutcome::NonRetriable(response));
                    }
                },
                Err(error) => {
                    if !classify_error(&error).is_retryable() {
                        return Err(error);
                    }
                    error
                }
            };

            if attempt >= config.max_attempts() {
                warn!(attempt, error = %error, "retry budget exhausted");
                return Err(TransportError::max_retries(attempt, error));
            }

            let delay = config.jittered(backoff_delay(config, wait, retry_after));
            warn!(
                attempt,
                delay_ms = delay.as_millis(),
                error = %error,
                "retryable failure, backing off"
            );
            self.retries.fetch_add(1, Ordering::Relaxed);

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(TransportError::Cancelled),
                () = tokio::time::sleep(delay) => {}
            }
            wait = config.next_wait(wait);
        }
    }

    /// GET with a cache in front: a cached body is returned without any
    /// request; a fresh 2xx body is stored under the URL for `ttl`.
    ///
    /// # Errors
    ///
    /// Same as [`execute`](Self::execute), plus [`TransportError::HttpStatus`]
    /// for a non-retryable response. Cache write failures are logged only.
    #[instrument(skip(self, cancel, spec, config, cache), fields(url = %spec.url))]
    pub async fn fetch_cached(
        &self,
        cancel: &CancellationToken,
        spec: &RequestSpec,
        config: &RetryConfig,
        cache: &dyn Cache,
        ttl: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if let Some(body) = cache.get(&spec.url) {
            debug!(bytes = body.len(), "cache hit");
            return Ok(body);
        }

        let response = match self.execute(cancel, spec, config).await? {
            RetryOutcome::Success(response) => response,
            RetryOutcome::NonRetriable(response) => {
                let error = TransportError::http_status(
                    response.url(),
                    response.status_code(),
                    response.retry_after(),
                );
                response.discard();
                return Err(error);
            }
        };

        let body = response.bytes(cancel).await?;
        if let Err(error) = cache.set(&spec.url, &body, ttl) {
            warn!(error = %error, "failed to cache response body");
        }
        Ok(body)
    }
}

/// `max(wait, retry_after)` with the server hint capped at `max_wait`.
fn backoff_delay(config: &RetryConfig, wait: Duration, retry_after: Option<Duration>) -> Duration {
    match retry_after {
        Some(hint) => wait.max(hint.min(config.max_wait())),
        None => wait,
    }
}

/// Parses a `Retry-After` header value (integer seconds or HTTP-date).
///
/// Values are capped at one hour. Negative, past or malformed values yield
/// `None`.
///
/// ```
/// use std::time::Duration;
/// use mediafetch_core::transport::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("soon"), None);
/// ```
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        return Some(cap_retry_after(Duration::from_secs(seconds)));
    }

    let datetime = httpdate::parse_http_date(header_value).ok()?;
    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(cap_retry_after(duration)),
        Err(_) => {
            debug!("Retry-After date is in the past");
            Some(Duration::ZERO)
        }
    }
}

fn cap_retry_after(duration: Duration) -> Duration {
    if duration > MAX_RETRY_AFTER {
        warn!(
            delay_secs = duration.as_secs(),
            max_secs = MAX_RETRY_AFTER.as_secs(),
            "Retry-After exceeds maximum, capping at 1 hour"
        );
        return MAX_RETRY_AFTER;
    }
    duration
}
