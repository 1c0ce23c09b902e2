use std::future::Future;
use std::time::Duration;

use log::warn;

use crate::config::RetryPolicy;
use crate::error::RemoteTranscodeError;

/// Exponential backoff: `initial * 2^attempt`, capped at `max`
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    initial.saturating_mul(factor).min(max)
}

/// Run `op`, retrying transient failures with backoff.
///
/// Permanent errors and cancellation return immediately.
pub async fn with_retry<T, F, Fut>(
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, RemoteTranscodeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteTranscodeError>>,
{
    let initial = Duration::from_secs(policy.initial_backoff_secs);
    let max = Duration::from_secs(policy.max_backoff_secs);
    let attempts = policy.max_attempts.max(1);

    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = backoff_delay(attempt, initial, max);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt + 1,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
