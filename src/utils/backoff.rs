use std::time::Duration;

use rand::Rng;

use crate::BackoffPolicy;

/// Exponential backoff with jitter, driven by a [`BackoffPolicy`].
///
/// The n-th delay is `base_delay * 2^n`, capped at `max_delay`, with up to 20%
/// random jitter subtracted so that many streams failing together do not
/// reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempts: usize,
}

impl Backoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempts: 0 }
    }

    /// Consecutive failures recorded since the last reset
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Records one failure and returns the delay before the next attempt.
    ///
    /// Returns `None` once a finite `max_retries` has been used up.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.is_unlimited() && self.attempts >= self.policy.max_retries {
            return None;
        }
        let delay = self.raw_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        Some(jitter(delay))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    fn raw_delay(
        &self,
        attempt: usize,
    ) -> Duration {
        let max = self.policy.max_delay();
        // 2^31 * base already exceeds any sane cap
        let shift = attempt.min(31) as u32;
        self.policy
            .base_delay()
            .checked_mul(1u32 << shift)
            .map_or(max, |d| d.min(max))
    }
}

fn jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as u64;
    if millis < 5 {
        return delay;
    }
    let spread = rand::thread_rng().gen_range(0..=millis / 5);
    Duration::from_millis(millis - spread)
}
