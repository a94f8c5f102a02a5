//! Exponential backoff with jitter.

use std::time::Duration;

use rand::Rng;

/// Delay before attempt number `attempt` (1-based): `base_ms` doubled per
/// earlier attempt, capped at `max_ms`, plus up to 10% jitter.
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    if attempt == 0 {
        return Duration::from_millis(0);
    }

    let exponential_base = 2u64.saturating_pow(attempt - 1);
    let delay_ms = base_ms.saturating_mul(exponential_base);
    let capped_delay = delay_ms.min(max_ms);

    // Apply jitter (0 to 10% of the delay)
    let jitter_range = capped_delay / 10;
    let jitter = if jitter_range > 0 {
        rand::thread_rng().gen_range(0..jitter_range)
    } else {
        0
    };

    Duration::from_millis(capped_delay + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn grows_then_caps() {
        assert_eq!(calculate_backoff(0, 1_000, 30_000), Duration::ZERO);

        let first = calculate_backoff(1, 1_000, 30_000).as_millis();
        assert!((1_000..1_100).contains(&first));

        let third = calculate_backoff(3, 1_000, 30_000).as_millis();
        assert!((4_000..4_400).contains(&third));

        let capped = calculate_backoff(40, 1_000, 30_000).as_millis();
        assert!((30_000..33_000).contains(&capped));
    }

    proptest! {
        #[test]
        fn never_below_base_nor_above_cap_plus_jitter(attempt in 1u32..64, base in 1u64..5_000, cap in 5_000u64..120_000) {
            let delay = calculate_backoff(attempt, base, cap).as_millis() as u64;
            prop_assert!(delay >= base.min(cap));
            prop_assert!(delay <= cap + cap / 10);
        }
    }
}
