#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::backoff::{Backoff as _, Constant};
use bon::Builder;

const DEFAULT_RETRY_DELAY_DURATION: Duration = Duration::from_secs(1);

/// Configuration for a [`ConnectionManager`](super::ConnectionManager).
///
/// Resolved once at construction; options left unset on the builder keep their defaults.
///
/// ```
/// use std::time::Duration;
/// use resilient_ws::ws::config::Config;
///
/// let config = Config::builder()
///     .retry_delay(Duration::from_millis(250))
///     .max_retries(5)
///     .build();
/// assert!(config.auto_reconnect);
/// assert_eq!(config.max_retries, Some(5));
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Builder)]
pub struct Config {
    /// Reconnect automatically after a disconnect nobody asked for
    #[builder(default = true)]
    pub auto_reconnect: bool,
    /// Fixed delay before every reconnection attempt. Zero disables reconnection.
    #[builder(default = DEFAULT_RETRY_DELAY_DURATION)]
    pub retry_delay: Duration,
    /// Maximum number of consecutive reconnection attempts.
    /// `None` means infinite retries.
    pub max_retries: Option<u32>,
    /// Try to decode incoming text frames as JSON before handing them out
    #[builder(default = true)]
    pub parse_messages: bool,
    /// Emit a `debug!` event for every transport notification.
    /// Only takes effect with the `tracing` feature enabled.
    #[builder(default = false)]
    pub debug_logging: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Decides whether, and after how long, the next automatic reconnect happens.
///
/// The pacing is a constant interval: no growth and no jitter.
#[derive(Debug)]
pub struct ReconnectPolicy {
    enabled: bool,
    max_retries: Option<u32>,
    backoff: Constant,
}

impl ReconnectPolicy {
    /// Whether automatic reconnection is switched on at all.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Delay before the next attempt, or `None` when no attempt should be made.
    ///
    /// `retry_count` is the number of attempts already made since the last successful open.
    pub fn next_delay(&mut self, retry_count: u32) -> Option<Duration> {
        if !self.enabled {
            return None;
        }

        if let Some(max) = self.max_retries
            && retry_count >= max
        {
            return None;
        }

        self.backoff.next_backoff()
    }
}

impl From<&Config> for ReconnectPolicy {
    fn from(config: &Config) -> Self {
        Self {
            enabled: config.auto_reconnect && !config.retry_delay.is_zero(),
            max_retries: config.max_retries,
            backoff: Constant::new(config.retry_delay),
        }
    }
}
