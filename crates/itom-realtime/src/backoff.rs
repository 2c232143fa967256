use std::time::Duration;

use itom_core::config::RealtimeConfig;

/// Exponential reconnect schedule: base, 2×base, 4×base … capped at `max`,
/// for at most `max_attempts` retries.
///
/// With the defaults: 1 s → 2 s → 4 s → … → 30 s (cap), 10 attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempts: 0,
        }
    }

    pub fn from_config(config: &RealtimeConfig) -> Self {
        Self::new(
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_max_ms),
            config.max_reconnect_attempts,
        )
    }

    /// Delay before the next retry, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        let factor = 1u32.checked_shl(self.attempts).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempts += 1;
        Some(delay)
    }

    /// Called on every successful open and on a manual reconnect.
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_backoff() -> Backoff {
        Backoff::from_config(&RealtimeConfig::default())
    }

    #[test]
    fn delays_double_then_cap() {
        let mut backoff = default_backoff();
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, [1, 2, 4, 8, 16, 30, 30, 30, 30, 30]);
    }

    #[test]
    fn exhausted_after_max_attempts() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 2);
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 2);
    }

    #[test]
    fn reset_restarts_schedule() {
        let mut backoff = default_backoff();
        backoff.next_delay();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 100);
        let last = std::iter::from_fn(|| backoff.next_delay()).last();
        assert_eq!(last, Some(Duration::from_secs(30)));
    }
}
