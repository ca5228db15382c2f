use std::future::Future;
use std::time::Duration;

use crate::sandbox::error::SandboxError;

pub const MAX_ATTEMPTS: u32 = 3;
const BASE_DELAY: Duration = Duration::from_secs(1);
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Retry a backend call with exponential backoff.
///
/// Auth rejections surface immediately; anything else gets up to
/// `MAX_ATTEMPTS` tries with 1s, 2s, 4s... delays capped at 10s.
pub async fn with_backoff<T, F, Fut>(op: &str, mut call: F) -> Result<T, SandboxError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SandboxError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < MAX_ATTEMPTS && err.is_retryable() => {
                let delay = delay_for_attempt(attempt);
                tracing::warn!(
                    op = %op,
                    attempt,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after backend error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn delay_for_attempt(attempt: u32) -> Duration {
    let exp = BASE_DELAY.saturating_mul(1u32 << (attempt - 1).min(16));
    exp.min(MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delays_double_and_cap() {
        assert_eq!(delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(delay_for_attempt(6), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("create", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(SandboxError::Backend("flaky".into()))
                } else {
                    Ok(7u32)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff("exec", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SandboxError::RateLimited("429".into())) }
        })
        .await;
        assert!(matches!(result, Err(SandboxError::RateLimited(_))));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn never_retries_auth_errors() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_backoff("connect", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(SandboxError::Auth("401 unauthorized".into())) }
        })
        .await;
        assert!(matches!(result, Err(SandboxError::Auth(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
