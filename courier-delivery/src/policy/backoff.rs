//! Exponential backoff with jitter

use std::time::Duration;

use rand::Rng;

/// Un-jittered delay after the `attempt`th attempt (1-indexed)
///
/// `min(base * 2^(attempt - 1), max)`
#[must_use]
pub fn backoff_step(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1);
    if exponent >= 32 {
        return max;
    }

    base.saturating_mul(1u32 << exponent).min(max)
}

/// Delay after the `attempt`th attempt, with jitter applied
///
/// Jitter only ever adds up to `jitter_factor` of the step and never pushes
/// the delay above `max`, so successive delays are non-decreasing.
#[must_use]
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration, jitter_factor: f64) -> Duration {
    let step = backoff_step(attempt, base, max);
    let headroom = max.saturating_sub(step);

    let jitter_range = step.mul_f64(jitter_factor.clamp(0.0, 1.0)).min(headroom);
    if jitter_range.is_zero() {
        return step;
    }

    let jitter = rand::rng().random_range(Duration::ZERO..=jitter_range);
    step + jitter
}
