use std::time::Duration;

use rand::Rng;

use crate::BackoffPolicy;

/// Exponential backoff with a cap and jitter.
///
/// The n-th delay is drawn from `[d/2, d]` where `d = min(base * 2^n, max)`.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(policy: &BackoffPolicy) -> Self {
        Self {
            base: policy.base_delay(),
            max: policy.max_delay().max(policy.base_delay()),
            attempts: 0,
        }
    }

    /// Delay before the next attempt; advances the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempts = self.attempts.saturating_add(1);
        Self::jitter(ceiling)
    }

    /// Upper bound of the next delay, without jitter.
    pub fn ceiling(&self) -> Duration {
        let factor = 2u32.checked_pow(self.attempts.min(31)).unwrap_or(u32::MAX);
        self.base.checked_mul(factor).unwrap_or(self.max).min(self.max)
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    fn jitter(ceiling: Duration) -> Duration {
        let ms = ceiling.as_millis() as u64;
        if ms < 2 {
            return ceiling;
        }
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(ms / 2..=ms))
    }
}
