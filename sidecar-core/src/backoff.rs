use std::time::Duration;

use crate::config::BackoffConfig;

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
pub const MAX_CRASH_COUNT: u32 = 5;

/// Restart delay and give-up threshold as a pure function of the consecutive crash count.
///
/// `delay(n) = min(2^(n-1) * base_delay, max_delay)` for `n >= 1`. The policy holds no
/// timer and no counter; the supervisor owns both.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrashPolicy {
    base_delay: Duration,
    max_delay: Duration,
    max_crash_count: u32,
}

impl Default for CrashPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_crash_count: MAX_CRASH_COUNT,
        }
    }
}

impl CrashPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_max_crash_count(mut self, max: u32) -> Self {
        self.max_crash_count = max.max(1);
        self
    }

    pub fn delay(&self, crash_count: u32) -> Duration {
        let exponent = crash_count.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `true` once `crash_count` consecutive failures mean no further automatic restart.
    pub fn is_exhausted(&self, crash_count: u32) -> bool {
        crash_count >= self.max_crash_count
    }

    /// Delay before the next automatic restart, or `None` when the policy gives up.
    pub fn next_delay(&self, crash_count: u32) -> Option<Duration> {
        if self.is_exhausted(crash_count) {
            None
        } else {
            Some(self.delay(crash_count))
        }
    }

    pub fn max_crash_count(&self) -> u32 {
        self.max_crash_count
    }
}

impl From<&BackoffConfig> for CrashPolicy {
    fn from(config: &BackoffConfig) -> Self {
        CrashPolicy::new()
            .with_base_delay(Duration::from_millis(config.base_delay_ms))
            .with_max_delay(Duration::from_millis(config.max_delay_ms))
            .with_max_crash_count(config.max_crash_count)
    }
}
