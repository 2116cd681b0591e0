//! Feedback-controlled extra delay applied before every request.
//!
//! The sleeper rises in fixed steps each time the upstream signals
//! throttling (429/504) or blocking (403), and falls geometrically while
//! the upstream stays quiet:
//!
//! ```text
//! on_rate_limit:  delay = min(delay + increment,     max)
//! on_forbidden:   delay = min(delay + increment / 2, max)
//! decay:          delay /= 2 for each whole decay period since the last bump,
//!                 snapping to zero once below the minimum threshold
//! ```
//!
//! State is shared by all tasks; throttling is global upstream, so a 429 seen
//! by one task slows every other task down as well.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::TransportError;
use super::constants::{
    DEFAULT_DECAY_AFTER, DEFAULT_MAX_SLEEP, DEFAULT_MIN_SLEEP, DEFAULT_SLEEP_INCREMENT,
};

/// Tuning for [`AdaptiveSleeper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleeperConfig {
    /// Delay added per rate-limit signal (half of it per forbidden signal).
    pub increment: Duration,
    /// Upper bound for the delay.
    pub max_sleep: Duration,
    /// Idle period after which the delay halves.
    pub decay_after: Duration,
    /// Delays below this snap to zero during decay.
    pub min_sleep: Duration,
}

impl Default for SleeperConfig {
    fn default() -> Self {
        Self {
            increment: DEFAULT_SLEEP_INCREMENT,
            max_sleep: DEFAULT_MAX_SLEEP,
            decay_after: DEFAULT_DECAY_AFTER,
            min_sleep: DEFAULT_MIN_SLEEP,
        }
    }
}

#[derive(Debug)]
struct SleeperState {
    delay: Duration,
    /// Reference point for decay; advanced by each whole period consumed.
    last_bump: Option<Instant>,
}

/// Shared adaptive delay controller.
#[derive(Debug)]
pub struct AdaptiveSleeper {
    config: SleeperConfig,
    state: Mutex<SleeperState>,
}

impl Default for AdaptiveSleeper {
    fn default() -> Self {
        Self::new(SleeperConfig::default())
    }
}

impl AdaptiveSleeper {
    /// Creates a sleeper starting at zero delay.
    #[must_use]
    pub fn new(config: SleeperConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SleeperState {
                delay: Duration::ZERO,
                last_bump: None,
            }),
        }
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> SleeperConfig {
        self.config
    }

    /// Returns the current delay after applying decay.
    #[must_use]
    pub fn current_delay(&self) -> Duration {
        let mut state = self.lock();
        self.decay(&mut state);
        state.delay
    }

    /// Applies decay, then waits for the current delay.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Cancelled`] if `cancel` fires first.
    pub async fn sleep(&self, cancel: &CancellationToken) -> Result<(), TransportError> {
        if cancel.is_cancelled() {
            return Err(TransportError::Cancelled);
        }

        let delay = self.current_delay();
        if delay.is_zero() {
            return Ok(());
        }

        debug!(delay_ms = delay.as_millis(), "adaptive sleep");
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(TransportError::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    /// Upstream signalled throttling (429/504): add a full increment.
    pub fn on_rate_limit(&self) {
        self.bump(self.config.increment, "rate limit");
    }

    /// Upstream signalled blocking (403): add half an increment.
    pub fn on_forbidden(&self) {
        self.bump(self.config.increment / 2, "forbidden");
    }

    /// Drops the delay back to zero.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.delay = Duration::ZERO;
        debug!("adaptive sleeper reset");
    }

    fn bump(&self, step: Duration, signal: &'static str) {
        let mut state = self.lock();
        self.decay(&mut state);

        let raised = state.delay.saturating_add(step);
        state.delay = raised.min(self.config.max_sleep);
        state.last_bump = Some(Instant::now());

        if raised >= self.config.max_sleep {
            warn!(
                signal,
                delay_secs = state.delay.as_secs_f64(),
                "adaptive sleep at maximum - upstream is throttling hard"
            );
        } else {
            debug!(
                signal,
                delay_ms = state.delay.as_millis(),
                "adaptive sleep increased"
            );
        }
    }

    /// Halves the delay once per whole decay period since the last bump.
    /// Caller holds the lock.
    fn decay(&self, state: &mut SleeperState) {
        let Some(last_bump) = state.last_bump else {
            return;
        };
        if state.delay.is_zero() || self.config.decay_after.is_zero() {
            return;
        }

        let elapsed = last_bump.elapsed();
        let periods = elapsed.as_nanos() / self.config.decay_after.as_nanos();
        if periods == 0 {
            return;
        }

        for _ in 0..periods {
            state.delay /= 2;
            if state.delay < self.config.min_sleep {
                state.delay = Duration::ZERO;
                break;
            }
        }

        // Keep the remainder of the current period so repeated calls don't re-halve.
        #[allow(clippy::cast_possible_truncation)]
        let consumed = self.config.decay_after * periods.min(u128::from(u32::MAX)) as u32;
        state.last_bump = Some(last_bump + consumed);

        debug!(
            periods = u64::try_from(periods).unwrap_or(u64::MAX),
            delay_ms = state.delay.as_millis(),
            "adaptive sleep decayed"
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SleeperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
