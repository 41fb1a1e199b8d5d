use backon::ExponentialBuilder;
use std::time::Duration;

/// Retry policy for outbound calls. Exponential with jitter, capped so a
/// single call gives up after roughly twelve minutes of backoff.
pub fn policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_jitter()
        .with_max_delay(Duration::from_secs(120))
        .with_max_times(12)
}

/// Shorter policy for calls where the caller has its own outer loop.
pub fn short_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_jitter()
        .with_max_delay(Duration::from_secs(15))
        .with_max_times(5)
}
