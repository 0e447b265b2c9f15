//! Pure retry, backoff, and slippage-widening arithmetic.
//!
//! Kept free of any gateway or clock dependency so the policy is testable
//! without a terminal.

use std::time::Duration;

use crate::gateway::FillingMode;

/// Delay before the first retry.
pub const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Cap on the doubling retry delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);

/// First reconnect attempt delay.
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Cap on the reconnect backoff.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Next order-retry delay from the prior one: doubling, capped.
pub fn next_delay(prior: Duration) -> Duration {
    (prior * 2).min(MAX_RETRY_DELAY)
}

/// Delay before retry number `attempt` (1-based): 200ms, 400ms, 800ms, ...
/// capped at [`MAX_RETRY_DELAY`].
pub fn retry_delay(attempt: u32) -> Duration {
    let mut delay = INITIAL_RETRY_DELAY;
    for _ in 1..attempt {
        delay = next_delay(delay);
    }
    delay
}

/// Reconnect backoff after `consecutive_failures` failed attempts:
/// 1s, 2s, 4s, ... capped at [`MAX_RECONNECT_DELAY`].
pub fn reconnect_delay(consecutive_failures: u32) -> Duration {
    let mut delay = INITIAL_RECONNECT_DELAY;
    for _ in 0..consecutive_failures {
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
    delay
}

/// Slippage tolerance for a submission after `price_rejections` requotes:
/// base, then +50% of base per rejection, capped at the pair maximum.
pub fn widened_slippage(base: u32, price_rejections: u32, max: u32) -> u32 {
    let widened = base as u64 + (base as u64 * price_rejections as u64) / 2;
    widened.min(max as u64) as u32
}

/// Filling mode for the next submission: fall back to a less strict mode
/// once two price rejections have been observed.
pub fn filling_for_attempt(configured: FillingMode, price_rejections: u32) -> FillingMode {
    if price_rejections >= 2 {
        configured.fallback()
    } else {
        configured
    }
}
