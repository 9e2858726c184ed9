use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff (factor 2) with symmetric random jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    jitter: Duration,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: Duration::ZERO,
            max_attempts: u32::MAX,
        }
    }

    /// Adds up to `jitter` of random offset in either direction.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Caps the total number of attempts (not retries).
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn jitter(&self) -> Duration {
        self.jitter
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u32 << shift;
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Delay before retry number `attempt` with jitter drawn from `rng`,
    /// clamped to `[0, max_delay]`.
    pub fn jittered_delay<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.delay_for_attempt(attempt).as_millis() as i64;
        let jitter = self.jitter.as_millis() as i64;
        let offset = if jitter > 0 {
            rng.gen_range(-jitter..=jitter)
        } else {
            0
        };
        let max = self.max_delay.as_millis() as i64;
        Duration::from_millis(base.saturating_add(offset).clamp(0, max) as u64)
    }

    /// Jittered delay using the thread-local RNG.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        self.jittered_delay(attempt, &mut rand::thread_rng())
    }
}

impl Default for RetryPolicy {
    /// 500 ms base, doubling, capped at 8 s per attempt, ±250 ms jitter,
    /// 5 attempts.
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(8))
            .with_jitter(Duration::from_millis(250))
            .with_max_attempts(5)
    }
}
