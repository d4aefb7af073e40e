//! Retry decisions and exponential backoff for task attempts.

use std::time::Duration;

use cortex_types::workflow::RetryPolicy;

/// Signature that matches any error.
pub const RETRY_ANY: &str = "*";

/// Stateless retry handler for task attempt failures.
///
/// All logic lives in associated functions that take the policy as a
/// parameter; attempts are 1-based.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether attempt `attempt` failing with `error` earns another attempt.
    pub fn should_retry(policy: &RetryPolicy, attempt: u32, error: &str) -> bool {
        attempt < policy.effective_max_attempts() && Self::is_retryable(policy, error)
    }

    /// Whether `error` matches the policy's retryable signatures.
    ///
    /// An empty list or a `"*"` entry matches everything. Otherwise a
    /// signature matches when it equals the error or is contained in it.
    pub fn is_retryable(policy: &RetryPolicy, error: &str) -> bool {
        policy.retryable_errors.is_empty()
            || policy
                .retryable_errors
                .iter()
                .any(|sig| sig == RETRY_ANY || sig == error || error.contains(sig.as_str()))
    }

    /// Delay before the attempt that follows failed attempt `attempt`:
    /// `min(initial * multiplier^(attempt - 1), max)`.
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let max = policy.max_delay();
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = policy.initial_delay_ms as f64 * policy.backoff_multiplier.powi(exponent);

        if !millis.is_finite() || millis >= max.as_millis() as f64 {
            return max;
        }
        Duration::from_millis(millis.max(0.0).round() as u64)
    }
}
