//! Property-based tests for the backoff policy and name normalization.
//!
//! Validates the retry ladder, budget ceiling, and acknowledgement-mode
//! invariants over the whole input space instead of spot-checking a few
//! redelivery counts.

use std::time::Duration;

use courier_core::{normalize_name, AckMode};
use courier_delivery::backoff::{BackoffDecision, BackoffPolicy, MAX_RETRY_TIMES};
use proptest::prelude::*;

fn retry_delay(policy: &BackoffPolicy, count: u64) -> Option<Duration> {
    match policy.decide(AckMode::Manual, count) {
        BackoffDecision::Retry { delay } => Some(delay),
        BackoffDecision::GiveUp { .. } => None,
    }
}

proptest! {
    /// Inside the budget, the delay ladder is 1s for the first attempts and
    /// `2n - 1` seconds from the second redelivery on.
    #[test]
    fn retry_delay_follows_the_linear_ladder(count in 0u64..MAX_RETRY_TIMES) {
        let policy = BackoffPolicy::default();
        let delay = retry_delay(&policy, count);
        let expected = if count <= 1 { 1 } else { 2 * count - 1 };
        prop_assert_eq!(delay, Some(Duration::from_secs(expected)));
    }

    /// Delays never shrink as the redelivery count grows.
    #[test]
    fn retry_delays_never_decrease(first in 0u64..MAX_RETRY_TIMES, second in 0u64..MAX_RETRY_TIMES) {
        prop_assume!(first <= second);
        let policy = BackoffPolicy::default();
        let earlier = retry_delay(&policy, first);
        let later = retry_delay(&policy, second);
        prop_assert!(earlier <= later);
    }

    /// Automatic acknowledgement mode never schedules a retry, whatever the
    /// redelivery count says.
    #[test]
    fn auto_mode_never_retries(count in any::<u64>()) {
        let policy = BackoffPolicy::default();
        prop_assert!(matches!(
            policy.decide(AckMode::Auto, count),
            BackoffDecision::GiveUp { .. }
        ), "auto mode must give up instead of retrying");
    }

    /// The configured budget is honored up to the built-in maximum: counts
    /// below the ceiling retry, counts at or above it give up.
    #[test]
    fn budget_is_capped_at_the_built_in_maximum(
        configured in 1u64..10_000,
        count in 0u64..200,
    ) {
        let policy = BackoffPolicy::new(configured);
        let ceiling = configured.min(MAX_RETRY_TIMES);
        prop_assert_eq!(policy.retry_ceiling(), ceiling);

        let retries = retry_delay(&policy, count).is_some();
        prop_assert_eq!(retries, count < ceiling);
    }

    /// Normalization replaces exactly the slashes and leaves everything
    /// else untouched.
    #[test]
    fn normalization_strips_every_slash(name in "[a-z0-9/]{0,64}") {
        let normalized = normalize_name(&name);

        prop_assert!(!normalized.contains('/'));
        prop_assert_eq!(normalized.len(), name.len());
        prop_assert_eq!(normalize_name(&normalized), normalized.clone());

        for (original, replaced) in name.chars().zip(normalized.chars()) {
            if original == '/' {
                prop_assert_eq!(replaced, '-');
            } else {
                prop_assert_eq!(replaced, original);
            }
        }
    }
}
