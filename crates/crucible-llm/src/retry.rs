//! Retry with exponential backoff and full jitter.
//!
//! Delay for attempt n (0-indexed) is `random(0, min(base * 2^n, max))`.
//! Full jitter spreads simultaneous retries across the whole window,
//! avoiding a thundering herd against an already-struggling backend.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crucible_core::errors::ProviderError;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        }
    }
}

impl RetryConfig {
    /// Full-jitter delay for a 0-indexed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jittered = rand::thread_rng().gen_range(0.0..=capped);
        Duration::from_millis(jittered as u64)
    }

    /// Upper bound of the jitter window for a 0-indexed attempt.
    pub fn max_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        Duration::from_millis(exp.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// Run `op` up to `1 + max_retries` times.
///
/// `is_retryable` classifies each failure; a non-retryable error
/// propagates immediately. Exhausting the budget re-raises the last
/// error. The predicate is not consulted on the final attempt since
/// there is nothing left to retry.
pub async fn retry_with_backoff<T, F, Fut, P>(
    config: &RetryConfig,
    is_retryable: P,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProviderError>>,
    P: Fn(&ProviderError) -> bool,
{
    let mut last_error: Option<ProviderError> = None;

    for attempt in 0..=config.max_retries {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt == config.max_retries {
                    last_error = Some(e);
                    break;
                }
                if !is_retryable(&e) {
                    return Err(e);
                }

                let delay = config.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after error"
                );
                last_error = Some(e);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_error.expect("loop ran at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn success_on_first_try() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result = retry_with_backoff(&fast_config(), ProviderError::is_retryable, move || {
            let calls = calls2.clone();
            async move {
                let _ = calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ProviderError>(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn two_failures_then_success_consults_predicate_twice() {
        let calls = Arc::new(AtomicU32::new(0));
        let predicate_calls = Arc::new(AtomicU32::new(0));

        let calls2 = calls.clone();
        let predicate_calls2 = predicate_calls.clone();
        let result = retry_with_backoff(
            &fast_config(),
            move |e: &ProviderError| {
                let _ = predicate_calls2.fetch_add(1, Ordering::SeqCst);
                e.is_retryable()
            },
            move || {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(ProviderError::Server {
                            status: 503,
                            body: "unavailable".into(),
                        })
                    } else {
                        Ok("recovered")
                    }
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(predicate_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn non_retryable_propagates_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), _> =
            retry_with_backoff(&fast_config(), ProviderError::is_retryable, move || {
                let calls = calls2.clone();
                async move {
                    let _ = calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::NotFound("model missing".into()))
                }
            })
            .await;

        assert!(matches!(result.unwrap_err(), ProviderError::NotFound(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reraises_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();
        let result: Result<(), _> =
            retry_with_backoff(&fast_config(), ProviderError::is_retryable, move || {
                let calls = calls2.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    Err(ProviderError::Server {
                        status: 500,
                        body: format!("failure {n}"),
                    })
                }
            })
            .await;

        // 1 initial + 3 retries
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result.unwrap_err() {
            ProviderError::Server { body, .. } => assert_eq!(body, "failure 3"),
            other => panic!("expected server error, got {other:?}"),
        }
    }

    #[test]
    fn delay_window_grows_exponentially_and_caps() {
        let config = RetryConfig {
            max_retries: 10,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
        };
        assert_eq!(config.max_delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(config.max_delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(config.max_delay_for_attempt(4), Duration::from_millis(16_000));
        // 1000 * 2^5 = 32000, capped at 30000
        assert_eq!(config.max_delay_for_attempt(5), Duration::from_millis(30_000));
        assert_eq!(config.max_delay_for_attempt(9), Duration::from_millis(30_000));
    }

    #[test]
    fn jittered_delay_stays_in_window() {
        let config = RetryConfig::default();
        for attempt in 0..5 {
            for _ in 0..50 {
                let delay = config.delay_for_attempt(attempt);
                assert!(delay <= config.max_delay_for_attempt(attempt));
            }
        }
    }

    #[test]
    fn config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.base_delay, Duration::from_millis(1000));
        assert_eq!(config.max_delay, Duration::from_millis(30_000));
    }
}
