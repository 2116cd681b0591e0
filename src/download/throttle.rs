//! Per-transfer throughput cap.
//!
//! After each chunk the throttle compares the bytes written so far with
//! what the cap allows for the elapsed time and sleeps off any surplus.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::DownloadError;

/// Byte-rate limiter for one body stream.
#[derive(Debug)]
pub struct Throttle {
    bytes_per_sec: u64,
    started: Instant,
    consumed: u64,
}

impl Throttle {
    /// Creates a throttle; `None` for a zero rate (no cap).
    #[must_use]
    pub fn new(bytes_per_sec: u64) -> Option<Self> {
        (bytes_per_sec > 0).then(|| Self {
            bytes_per_sec,
            started: Instant::now(),
            consumed: 0,
        })
    }

    /// Configured cap.
    #[must_use]
    pub fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Accounts for `bytes` and waits until the cap allows them.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Cancelled`] if `cancel` fires while waiting.
    pub async fn consume(
        &mut self,
        bytes: usize,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        self.consumed = self
            .consumed
            .saturating_add(u64::try_from(bytes).unwrap_or(u64::MAX));

        #[allow(clippy::cast_precision_loss)]
        let allowed_at =
            Duration::from_secs_f64(self.consumed as f64 / self.bytes_per_sec as f64);
        let elapsed = self.started.elapsed();
        if allowed_at <= elapsed {
            return Ok(());
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(DownloadError::Cancelled),
            () = tokio::time::sleep(allowed_at - elapsed) => Ok(()),
        }
    }
}
