use rand::Rng;
use std::time::Duration;

/// Exponential backoff: `base * 2^attempt`, capped at `max`, with optional full jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }

    /// Delay before retry `attempt`, stretched to a server-provided `Retry-After` when that is
    /// longer. The hint is still bounded by `max`.
    pub fn delay_after(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let computed = self.delay(attempt);
        match retry_after {
            Some(hint) => computed.max(hint.min(self.max)),
            None => computed,
        }
    }
}
