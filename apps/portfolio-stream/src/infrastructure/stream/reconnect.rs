//! Reconnection Policy
//!
//! Exponential backoff for WebSocket reconnection: delay(attempt) =
//! min(base × 2^(attempt−1), cap), with a bounded number of attempts before
//! the connection is declared failed. The attempt counter resets on every
//! successful connection, so a long-lived session always gets the full
//! retry budget after a drop.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub cap_delay: Duration,
    /// Maximum number of reconnection attempts (0 = unlimited).
    pub max_attempts: u32,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    /// Zero disables jitter, making delays exactly the backoff schedule.
    pub jitter_factor: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            cap_delay: Duration::from_millis(30_000),
            max_attempts: 5,
            jitter_factor: 0.0,
        }
    }
}

impl ReconnectConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(
        base_delay: Duration,
        cap_delay: Duration,
        max_attempts: u32,
        jitter_factor: f64,
    ) -> Self {
        Self {
            base_delay,
            cap_delay,
            max_attempts,
            jitter_factor,
        }
    }
}

/// Reconnection policy implementing capped exponential backoff.
///
/// # Example
///
/// ```rust
/// use portfolio_stream::infrastructure::stream::reconnect::{ReconnectConfig, ReconnectPolicy};
/// use std::time::Duration;
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
///
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(2000)));
///
/// // Successful connection restores the full retry budget.
/// policy.reset();
/// assert_eq!(policy.next_delay(), Some(Duration::from_millis(1000)));
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
        }
    }

    /// Get the delay for the next attempt, or `None` when attempts are
    /// exhausted.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.config.max_attempts > 0 && self.attempt_count >= self.config.max_attempts {
            return None;
        }

        self.attempt_count += 1;

        // base × 2^(attempt−1), saturating, then capped.
        let base_millis = u64::try_from(self.config.base_delay.as_millis()).unwrap_or(u64::MAX);
        let scaled = base_millis.saturating_mul(1_u64.checked_shl(self.attempt_count - 1).unwrap_or(u64::MAX));
        let cap_millis = u64::try_from(self.config.cap_delay.as_millis()).unwrap_or(u64::MAX);
        let capped = Duration::from_millis(scaled.min(cap_millis));

        Some(self.apply_jitter(capped))
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
    }

    /// Get the current attempt count.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    /// Apply jitter to a duration.
    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}
