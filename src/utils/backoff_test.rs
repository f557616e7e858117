use std::time::Duration;

use crate::backoff::ExponentialBackoff;
use crate::BackoffPolicy;

fn policy(
    base_delay_ms: u64,
    max_delay_ms: u64,
) -> BackoffPolicy {
    BackoffPolicy {
        max_retries: 0,
        timeout_ms: 1000,
        base_delay_ms,
        max_delay_ms,
    }
}

#[test]
fn test_delay_doubles_until_cap() {
    let mut backoff = ExponentialBackoff::new(&policy(100, 1000));

    let expected_ceilings = [100, 200, 400, 800, 1000, 1000];
    for ceiling in expected_ceilings {
        assert_eq!(backoff.ceiling(), Duration::from_millis(ceiling));
        let delay = backoff.next_delay();
        assert!(delay <= Duration::from_millis(ceiling), "{delay:?} > {ceiling}ms");
        assert!(delay >= Duration::from_millis(ceiling / 2), "{delay:?} < {ceiling}/2 ms");
    }
    assert_eq!(backoff.attempts(), 6);
}

#[test]
fn test_reset_returns_to_floor() {
    let mut backoff = ExponentialBackoff::new(&policy(10, 10_000));
    for _ in 0..5 {
        backoff.next_delay();
    }
    assert_eq!(backoff.ceiling(), Duration::from_millis(320));

    backoff.reset();
    assert_eq!(backoff.attempts(), 0);
    assert_eq!(backoff.ceiling(), Duration::from_millis(10));
}

#[test]
fn test_many_attempts_do_not_overflow() {
    let mut backoff = ExponentialBackoff::new(&policy(1000, 60_000));
    for _ in 0..100 {
        assert!(backoff.next_delay() <= Duration::from_millis(60_000));
    }
}
