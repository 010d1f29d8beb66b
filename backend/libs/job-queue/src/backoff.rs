/// Exponential backoff between job attempts
use rand::Rng;
use std::time::Duration;

const MAX_EXPONENT: u32 = 32;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay unit multiplied by `2^attempts`
    pub base: Duration,
    /// Upper bound for any delay
    pub cap: Duration,
    /// Add random jitter to the delay (±30%, still capped)
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            jitter: false,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// `min(base * 2^attempts, cap)`
    ///
    /// - attempts 1, base 1s: 2s
    /// - attempts 2, base 1s: 4s
    /// - attempts 9, base 1s: 300s (capped)
    pub fn delay(&self, attempts: u32) -> Duration {
        let factor = 1u128 << attempts.min(MAX_EXPONENT);
        let nanos = self.base.as_nanos().saturating_mul(factor);
        let capped = nanos.min(self.cap.as_nanos());
        Duration::from_nanos(u64::try_from(capped).unwrap_or(u64::MAX))
    }

    /// Delay for the next run after `attempts` attempts.
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let delay = self.delay(attempts);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let jitter_factor = 1.0 + rand::thread_rng().gen_range(-0.3..0.3);
        delay.mul_f64(jitter_factor).min(self.cap)
    }
}
