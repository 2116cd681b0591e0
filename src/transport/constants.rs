//! Constants for the transport module (timeouts, sleeper tuning, Retry-After cap).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large media files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Default extra delay added per throttling signal.
pub const DEFAULT_SLEEP_INCREMENT: Duration = Duration::from_secs(2);

/// Default cap on the adaptive extra delay.
pub const DEFAULT_MAX_SLEEP: Duration = Duration::from_secs(30);

/// Default idle period after which the adaptive delay halves.
pub const DEFAULT_DECAY_AFTER: Duration = Duration::from_secs(60);

/// Adaptive delays below this snap to zero during decay.
pub const DEFAULT_MIN_SLEEP: Duration = Duration::from_secs(2);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);
