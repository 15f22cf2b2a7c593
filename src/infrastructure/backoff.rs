//! Delays between reconnect attempts

use std::time::Duration;

use rand::Rng;

/// Reconnect delay policy.
///
/// A `multiplier` of `1.0` without jitter is a fixed delay, which is what
/// every transport uses unless told otherwise.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    /// Relative spread applied to each delay (0.0 to 1.0)
    pub jitter: f64,
}

impl BackoffConfig {
    /// Constant delay between attempts.
    pub fn fixed(delay_ms: u64) -> Self {
        let delay = Duration::from_millis(delay_ms);
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Doubling delay from `initial_ms` up to `max_ms`, spread by 10%.
    pub fn exponential(initial_ms: u64, max_ms: u64) -> Self {
        Self {
            initial: Duration::from_millis(initial_ms),
            max: Duration::from_millis(max_ms.max(initial_ms)),
            multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::fixed(1_000)
    }
}

/// Attempt counter over a [`BackoffConfig`].
#[derive(Debug)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn with_config(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(32) as i32;
        self.attempt = self.attempt.saturating_add(1);

        let base = self.config.initial.as_secs_f64() * self.config.multiplier.max(1.0).powi(exponent);
        let capped = base.min(self.config.max.as_secs_f64());

        let spread = capped * self.config.jitter.clamp(0.0, 1.0);
        let secs = if spread > 0.0 {
            capped + rand::rng().random_range(-spread..spread)
        } else {
            capped
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Start over after a successful session.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts made since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_delay_never_grows() {
        let mut backoff = Backoff::with_config(BackoffConfig::default());

        for _ in 0..5 {
            assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        }
        assert_eq!(backoff.attempt(), 5);
    }

    #[test]
    fn test_growth_is_capped() {
        let mut backoff = Backoff::with_config(BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::exponential(100, 500)
        });

        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 500, 500]);
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let mut backoff = Backoff::with_config(BackoffConfig::exponential(1_000, 1_000));

        for _ in 0..20 {
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_millis(899) && delay <= Duration::from_millis(1_100));
        }
    }

    #[test]
    fn test_reset_restarts_growth() {
        let mut backoff = Backoff::with_config(BackoffConfig {
            jitter: 0.0,
            ..BackoffConfig::exponential(10, 1_000)
        });
        backoff.next_delay();
        backoff.next_delay();

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }
}
