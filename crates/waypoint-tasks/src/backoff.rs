use rand::Rng;
use waypoint_schema::RetryPolicy;

/// Multiplicative jitter bound applied to every retry delay.
pub const JITTER_RATIO: f64 = 0.25;

/// Pre-jitter delay before `attempt` (1-based): `min(base * mult^(attempt-1), max)`.
pub fn backoff_delay_ms(policy: &RetryPolicy, attempt: u32) -> u64 {
    let base = policy.base_delay_ms as f64;
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = base * policy.backoff_multiplier.powi(exponent);
    let capped = if raw.is_finite() {
        raw.min(policy.max_delay_ms as f64)
    } else {
        policy.max_delay_ms as f64
    };
    capped.max(base) as u64
}

/// Scale `delay_ms` by `1 + factor`, with `factor` clamped to ±[`JITTER_RATIO`],
/// never going below `floor_ms`.
pub fn apply_jitter(delay_ms: u64, factor: f64, floor_ms: u64) -> u64 {
    let factor = factor.clamp(-JITTER_RATIO, JITTER_RATIO);
    let jittered = (delay_ms as f64 * (1.0 + factor)).round();
    (jittered as u64).max(floor_ms)
}

pub fn retry_delay_ms(policy: &RetryPolicy, attempt: u32) -> u64 {
    let factor = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
    apply_jitter(
        backoff_delay_ms(policy, attempt),
        factor,
        policy.base_delay_ms,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 6,
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_escalation() {
        let p = policy();
        assert_eq!(backoff_delay_ms(&p, 1), 1_000);
        assert_eq!(backoff_delay_ms(&p, 2), 2_000);
        assert_eq!(backoff_delay_ms(&p, 3), 4_000);
        assert_eq!(backoff_delay_ms(&p, 4), 8_000);
        assert_eq!(backoff_delay_ms(&p, 5), 10_000);
        assert_eq!(backoff_delay_ms(&p, 500), 10_000);
    }

    #[test]
    fn test_pre_jitter_within_bounds() {
        let p = policy();
        for attempt in 1..=40 {
            let delay = backoff_delay_ms(&p, attempt);
            assert!(delay >= p.base_delay_ms && delay <= p.max_delay_ms);
        }
    }

    #[test]
    fn test_jitter_extremes() {
        assert_eq!(apply_jitter(2_000, 0.25, 1_000), 2_500);
        assert_eq!(apply_jitter(2_000, -0.25, 1_000), 1_500);
        assert_eq!(apply_jitter(2_000, 3.0, 1_000), 2_500);
        assert_eq!(apply_jitter(1_000, -0.25, 1_000), 1_000);
    }

    #[test]
    fn test_retry_delay_within_jitter_band() {
        let p = policy();
        for _ in 0..500 {
            let delay = retry_delay_ms(&p, 2);
            assert!((1_500..=2_500).contains(&delay), "delay {delay} out of band");

            let first = retry_delay_ms(&p, 1);
            assert!((1_000..=1_250).contains(&first), "delay {first} below floor");
        }
    }
}
