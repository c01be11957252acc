//! Retry backoff computation.

use std::time::Duration;

use rand::Rng;

use crate::spec::RetryPolicy;

/// Delay before the retry that follows a failed attempt `attempt` (1-based):
/// `backoff_ms * multiplier^(attempt - 1)`, scaled by uniform(0.5, 1.5) when
/// jitter is on.
pub fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let base = policy.backoff_ms as f64 * policy.backoff_multiplier.powi(exponent as i32);
    let scaled = if policy.jitter && base > 0.0 {
        base * rand::rng().random_range(0.5..1.5)
    } else {
        base
    };
    Duration::from_millis(scaled.max(0.0) as u64)
}
