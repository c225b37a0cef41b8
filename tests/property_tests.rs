//! Property-based tests for backoff, key generation and the circuit breaker.
//!
//! Uses proptest to verify invariants across random inputs:
//! - Backoff delays stay within `[base, 1.3 * base]` and never exceed `1.3 * max`
//! - Sanitized filenames use only `[A-Za-z0-9._-]` and are at most 100 chars
//! - Generated keys never contain the caller's filename stem
//! - The breaker never admits a call while open

// Property tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::time::{Duration, Instant};
use stowage::resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, RetryPolicy};
use stowage::storage::keys::{MAX_DISPLAY_NAME_LEN, generate_key, sanitize_filename, validate_key};

// ============================================================================
// Backoff
// ============================================================================

proptest! {
    /// Property: jittered delay lies within 30% above the exponential base.
    #[test]
    fn prop_backoff_within_jitter_bounds(
        initial in 1_u64..5_000,
        max_factor in 1_u64..50,
        multiplier in 1.0_f64..4.0,
        attempt in 0_u32..12,
        seed in any::<u64>(),
    ) {
        let policy = RetryPolicy::default()
            .with_initial_delay_ms(initial)
            .with_max_delay_ms(initial * max_factor)
            .with_backoff_multiplier(multiplier);
        let mut rng = StdRng::seed_from_u64(seed);

        let base = policy.base_delay_ms(attempt);
        let delay = policy.delay_for_attempt(attempt, &mut rng);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap();

        prop_assert!(delay_ms >= base);
        prop_assert!(delay_ms <= base + base * 3 / 10);
        prop_assert!(delay_ms <= policy.max_delay_ms + policy.max_delay_ms * 3 / 10);
    }

    /// Property: the base delay never decreases with the attempt number.
    #[test]
    fn prop_backoff_is_monotonic(
        initial in 1_u64..1_000,
        multiplier in 1.0_f64..3.0,
        attempt in 0_u32..20,
    ) {
        let policy = RetryPolicy::default()
            .with_initial_delay_ms(initial)
            .with_max_delay_ms(60_000)
            .with_backoff_multiplier(multiplier);
        prop_assert!(policy.base_delay_ms(attempt + 1) >= policy.base_delay_ms(attempt));
    }

    /// Property: the same seed yields the same delays.
    #[test]
    fn prop_seeded_jitter_is_deterministic(seed in any::<u64>(), attempt in 0_u32..8) {
        let policy = RetryPolicy::default();
        let a = policy.delay_for_attempt(attempt, &mut StdRng::seed_from_u64(seed));
        let b = policy.delay_for_attempt(attempt, &mut StdRng::seed_from_u64(seed));
        prop_assert_eq!(a, b);
    }
}

// ============================================================================
// Keys
// ============================================================================

proptest! {
    /// Property: sanitized names use a restricted alphabet and bounded length.
    #[test]
    fn prop_sanitize_alphabet_and_length(name in "\\PC{0,300}") {
        let sanitized = sanitize_filename(&name);
        prop_assert!(sanitized.chars().count() <= MAX_DISPLAY_NAME_LEN);
        prop_assert!(sanitized
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'));
    }

    /// Property: sanitizing twice changes nothing.
    #[test]
    fn prop_sanitize_is_idempotent(name in "\\PC{0,200}") {
        let once = sanitize_filename(&name);
        prop_assert_eq!(sanitize_filename(&once), once.clone());
    }

    /// Property: keys are valid, owner-scoped and never embed the filename stem.
    #[test]
    fn prop_generated_key_shape(
        owner in "[a-z0-9-]{1,20}",
        stem in "[A-Z][A-Za-z]{11,29}",
        ext in "[a-z]{1,4}",
    ) {
        let key = generate_key(&owner, &format!("{stem}.{ext}")).unwrap();
        prop_assert!(validate_key(&key.path).is_ok());
        let owner_prefix = format!("{owner}/");
        prop_assert!(key.path.starts_with(&owner_prefix));
        let ext_suffix = format!(".{ext}");
        prop_assert!(key.path.ends_with(&ext_suffix));
        prop_assert!(!key.path.contains(&stem));
        prop_assert_eq!(key.path.split('/').count(), 4);
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

proptest! {
    /// Property: once open, no call is admitted before the reset timeout.
    #[test]
    fn prop_open_breaker_rejects_until_reset(
        threshold in 1_u32..10,
        reset_ms in 100_u64..120_000,
        probe_offsets in prop::collection::vec(0_u64..120_000, 1..20),
    ) {
        let breaker = CircuitBreaker::new(
            &CircuitBreakerConfig::default()
                .with_failure_threshold(threshold)
                .with_reset_timeout_ms(reset_ms)
                .with_monitoring_window_ms(600_000),
            "remote",
        );
        let start = Instant::now();
        for _ in 0..threshold {
            breaker.record_failure_at(start);
        }
        prop_assert_eq!(breaker.state(), CircuitState::Open);

        for offset in probe_offsets.into_iter().filter(|o| *o < reset_ms) {
            let permit = breaker.can_execute_at(start + Duration::from_millis(offset));
            prop_assert!(!permit.allowed);
            prop_assert!(permit.retry_after_secs.unwrap_or(0) > 0);
        }

        let permit = breaker.can_execute_at(start + Duration::from_millis(reset_ms));
        prop_assert!(permit.allowed);
        prop_assert!(permit.half_open);
    }
}
