//! Global request-spacing rate limiter.
//!
//! The upstream enforces its quota per account, not per connection, so a
//! single [`RateLimiter`] is shared by every task that talks to it. Grants
//! are serialized under one async mutex: no two grants are ever closer than
//! the configured interval.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use mediafetch_core::transport::RateLimiter;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), mediafetch_core::transport::TransportError> {
//! let limiter = RateLimiter::new(Duration::from_millis(200));
//! let cancel = CancellationToken::new();
//!
//! limiter.wait(&cancel).await?; // immediate
//! limiter.wait(&cancel).await?; // ~200ms later
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use super::TransportError;

/// Enforces a minimum spacing between consecutive requests.
///
/// `RateLimiter` is `Send + Sync` and meant to be shared through `Arc`.
#[derive(Debug)]
pub struct RateLimiter {
    /// Minimum spacing in nanoseconds; zero disables the limiter.
    interval_nanos: AtomicU64,

    /// Time of the last granted request.
    /// `None` until the first grant (the first request is immediate).
    last_grant: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// Creates a rate limiter with the given minimum interval.
    #[must_use]
    #[instrument(skip_all, fields(interval_ms = interval.as_millis()))]
    pub fn new(interval: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            interval_nanos: AtomicU64::new(duration_to_nanos(interval)),
            last_grant: Mutex::new(None),
        }
    }

    /// Creates a disabled rate limiter that grants immediately.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.interval_nanos.load(Ordering::SeqCst) == 0
    }

    /// Returns the current minimum interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos.load(Ordering::SeqCst))
    }

    /// Changes the interval; takes effect on the next wait.
    pub fn set_interval(&self, interval: Duration) {
        debug!(interval_ms = interval.as_millis(), "rate limit interval changed");
        self.interval_nanos
            .store(duration_to_nanos(interval), Ordering::SeqCst);
    }

    /// Blocks until at least `interval` has elapsed since the previous grant.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Cancelled`] if `cancel` fires while waiting.
    /// No grant is recorded in that case.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        if self.is_disabled() {
            return Ok(());
        }

        // Held across the sleep so concurrent callers queue behind each other.
        let mut last_grant = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(TransportError::Cancelled),
            guard = self.last_grant.lock() => guard,
        };

        if let Some(previous) = *last_grant {
            let interval = self.interval();
            let elapsed = previous.elapsed();
            if elapsed < interval {
                let delay = interval.saturating_sub(elapsed);
                debug!(delay_ms = delay.as_millis(), "applying rate limit delay");
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(TransportError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }

        *last_grant = Some(Instant::now());
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn duration_to_nanos(duration: Duration) -> u64 {
    duration.as_nanos().min(u128::from(u64::MAX)) as u64
}
