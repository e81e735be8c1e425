//! Delay computation between attempts

use std::time::Duration;

use rand::Rng;

use crate::classifier::ErrorType;
use crate::models::RetryPolicy;

/// Minimum delay after a rate-limit failure
pub const RATE_LIMIT_FLOOR: Duration = Duration::from_millis(5_000);

/// Minimum delay after a network failure
pub const NETWORK_FLOOR: Duration = Duration::from_millis(500);

/// Floor applied after jitter for a failure type
pub fn type_floor(error_type: ErrorType) -> Duration {
    match error_type {
        ErrorType::RateLimit => RATE_LIMIT_FLOOR,
        ErrorType::Network => NETWORK_FLOOR,
        _ => Duration::ZERO,
    }
}

/// Delay to wait after failed attempt `attempt` (1-based).
///
/// Exponential base capped at `max_delay`, then `+/- jitter_range` jitter, then
/// the type floor.
pub fn next_delay<R: Rng + ?Sized>(
    policy: &RetryPolicy,
    attempt: u32,
    error_type: ErrorType,
    rng: &mut R,
) -> Duration {
    let mut millis = policy.base_delay(attempt).as_millis() as f64;

    if policy.jitter && policy.jitter_range > 0.0 {
        let range = policy.jitter_range.min(1.0);
        millis *= 1.0 + rng.gen_range(-range..=range);
    }

    let floor = type_floor(error_type).as_millis() as f64;
    Duration::from_millis(millis.max(floor).max(0.0).floor() as u64)
}
