use std::time::Duration;

use super::*;
use crate::BackoffPolicy;

fn policy(max_retries: usize) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        timeout_ms: 100,
        base_delay_ms: 100,
        max_delay_ms: 1000,
    }
}

#[test]
fn delays_grow_exponentially_within_jitter() {
    let mut backoff = Backoff::new(policy(0));

    for expected in [100u64, 200, 400, 800] {
        let delay = backoff.next_delay().unwrap();
        assert!(delay <= Duration::from_millis(expected), "{delay:?} > {expected}ms");
        assert!(delay >= Duration::from_millis(expected * 4 / 5), "{delay:?} < 80% of {expected}ms");
    }
}

#[test]
fn delays_are_capped_at_max_delay() {
    let mut backoff = Backoff::new(policy(0));

    for _ in 0..64 {
        let delay = backoff.next_delay().unwrap();
        assert!(delay <= Duration::from_millis(1000));
    }
    assert_eq!(backoff.attempts(), 64);
}

#[test]
fn finite_policy_is_exhausted_after_max_retries() {
    let mut backoff = Backoff::new(policy(3));

    assert!(backoff.next_delay().is_some());
    assert!(backoff.next_delay().is_some());
    assert!(backoff.next_delay().is_some());
    assert!(backoff.next_delay().is_none());
}

#[test]
fn reset_restarts_the_sequence() {
    let mut backoff = Backoff::new(policy(2));
    backoff.next_delay();
    backoff.next_delay();
    assert!(backoff.next_delay().is_none());

    backoff.reset();

    assert_eq!(backoff.attempts(), 0);
    let delay = backoff.next_delay().unwrap();
    assert!(delay <= Duration::from_millis(100));
}
