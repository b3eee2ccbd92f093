// Retry with exponential backoff
//
// Only HTTP 429 and 5xx are retried. The sleep between attempts races the
// cancellation token, so cancelling mid-retry ends the loop immediately.

use reqwest::header::{HeaderMap, RETRY_AFTER};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::errors::ProviderError;
use crate::settings::ProviderSettings;

/// Total attempts when the settings do not say otherwise
pub const DEFAULT_ATTEMPTS: u32 = 4;
/// Delay before the first retry
pub const BASE_DELAY_MS: u64 = 1000;
/// Upper bound for any single wait, `Retry-After` included
pub const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, first try included
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_ATTEMPTS,
            base_delay: Duration::from_millis(BASE_DELAY_MS),
            max_delay: MAX_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let defaults = Self::default();
        Self {
            attempts: settings.retries.unwrap_or(defaults.attempts).max(1),
            base_delay: settings
                .retry_wait_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.base_delay),
            max_delay: defaults.max_delay,
        }
    }

    /// Wait before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint.min(self.max_delay);
        }
        let exponent = retry.saturating_sub(1).min(30);
        self.base_delay
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.max_delay)
    }
}

pub fn is_retryable(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

/// `Retry-After` as delta-seconds or an HTTP date
pub fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let date = chrono::DateTime::parse_from_rfc2822(value).ok()?;
    (date.with_timezone(&chrono::Utc) - chrono::Utc::now())
        .to_std()
        .ok()
}

/// Why a single attempt failed
#[derive(Debug)]
pub enum AttemptError {
    /// Non-success HTTP status
    Status {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
    /// Anything that must not be retried
    Fatal(ProviderError),
}

#[derive(Debug)]
pub enum RetryOutcome<T> {
    Completed { value: T, retries: u32 },
    Cancelled,
}

/// Run `operation` until it succeeds, fails fatally, or attempts run out
///
/// `operation` receives the 1-based attempt number.
pub async fn with_retry<T, F, Fut>(
    provider: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<RetryOutcome<T>, ProviderError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, AttemptError>>,
{
    let attempts = policy.attempts.max(1);

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            return Ok(RetryOutcome::Cancelled);
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return Ok(RetryOutcome::Cancelled),
            result = operation(attempt) => result,
        };

        let (status, body, retry_after) = match result {
            Ok(value) => {
                return Ok(RetryOutcome::Completed {
                    value,
                    retries: attempt - 1,
                })
            }
            Err(AttemptError::Fatal(e)) => return Err(e),
            Err(AttemptError::Status {
                status,
                body,
                retry_after,
            }) => (status, body, retry_after),
        };

        if !is_retryable(status) {
            return Err(ProviderError::Http {
                provider: provider.to_string(),
                status,
                body,
            });
        }

        if attempt == attempts {
            return Err(ProviderError::RetryExhausted {
                provider: provider.to_string(),
                attempts,
                status,
                body,
            });
        }

        let delay = policy.delay_for(attempt, retry_after);
        tracing::warn!(
            provider,
            attempt,
            status,
            "retryable response, retrying in {:?}",
            delay
        );

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(provider, "retry aborted by cancellation");
                return Ok(RetryOutcome::Cancelled);
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }

    // attempts >= 1, so the loop always returns
    Ok(RetryOutcome::Cancelled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            max_delay: MAX_DELAY,
        }
    }

    fn status(code: u16) -> AttemptError {
        AttemptError::Status {
            status: code,
            body: "nope".to_string(),
            retry_after: None,
        }
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(429));
        assert!(is_retryable(500));
        assert!(is_retryable(503));
        assert!(!is_retryable(400));
        assert!(!is_retryable(401));
        assert!(!is_retryable(404));
    }

    #[test]
    fn test_delay_growth_and_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3, None), Duration::from_millis(4000));
        assert_eq!(policy.delay_for(10, None), MAX_DELAY);
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(120))),
            MAX_DELAY
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_policy_from_settings() {
        let settings = ProviderSettings {
            retries: Some(3),
            retry_wait_ms: Some(250),
            ..ProviderSettings::default()
        };
        let policy = RetryPolicy::from_settings(&settings);
        assert_eq!(policy.attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(250));
        assert_eq!(RetryPolicy::from_settings(&ProviderSettings::default()).attempts, 4);
    }

    #[tokio::test]
    async fn test_two_failures_then_success() {
        let calls = AtomicU32::new(0);
        let outcome = with_retry("test", &quick(3), &CancellationToken::new(), |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(status(429))
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            outcome,
            RetryOutcome::Completed { value: "done", retries: 2 }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_and_fatal_status() {
        let err = with_retry("test", &quick(2), &CancellationToken::new(), |_| async {
            Err::<(), _>(status(503))
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ProviderError::RetryExhausted { attempts: 2, status: 503, .. }
        ));

        let calls = AtomicU32::new(0);
        let err = with_retry("test", &quick(5), &CancellationToken::new(), |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(status(400)) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Http { status: 400, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_aborts_sleep() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            attempts: 3,
            base_delay: Duration::from_secs(60),
            max_delay: MAX_DELAY,
        };

        let trigger = cancel.clone();
        let started = std::time::Instant::now();
        let outcome = with_retry("test", &policy, &cancel, |_| {
            trigger.cancel();
            async { Err::<(), _>(status(429)) }
        })
        .await
        .unwrap();

        assert!(matches!(outcome, RetryOutcome::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
