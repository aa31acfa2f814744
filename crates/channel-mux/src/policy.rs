//! Reconnection policy shared by the manager and the legacy per-feature socket.

use std::time::Duration;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(15);
pub const DEFAULT_BACKOFF_FACTOR: u32 = 2;

/// Delay between reconnect attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    Fixed(Duration),
    /// `initial * factor^(attempt - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        factor: u32,
    },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based; 0 is treated as 1).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential {
                initial,
                max,
                factor,
            } => {
                let exp = attempt.saturating_sub(1);
                initial
                    .saturating_mul(factor.saturating_pow(exp))
                    .min(*max)
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial: DEFAULT_INITIAL_DELAY,
            max: DEFAULT_MAX_DELAY,
            factor: DEFAULT_BACKOFF_FACTOR,
        }
    }
}

/// Bounded retry budget plus delay function.
///
/// `retry_after(consumed)` answers "may another attempt run after `consumed`
/// attempts were spent, and after how long?". Call sites decide what they
/// count: the manager counts failed attempts (so `max_attempts` bounds the
/// total number of transport opens), the legacy socket counts reconnects.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl ReconnectPolicy {
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed(delay),
        }
    }

    pub fn retry_after(&self, consumed: u32) -> Option<Duration> {
        (consumed < self.max_attempts).then(|| self.backoff.delay_for_attempt(consumed))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff: Backoff::default(),
        }
    }
}
