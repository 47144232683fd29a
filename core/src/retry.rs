//! Retry mechanism with linear, exponential, fibonacci and custom backoff
//!
//! The mechanism only suspends the calling task between attempts. An attempt
//! that is already running is never aborted; cancellation is observed before
//! the next attempt and while waiting for it.

use crate::clock::Clock;
use crate::config::{RetryConfig, RetryStrategy};
use crate::errors::OperationError;
use crate::history::RetryAttemptRecord;
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why the retry loop gave up
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RetryError {
    /// Every permitted attempt failed
    #[error("gave up after {attempts} attempt(s): {error}")]
    Exhausted { attempts: u32, error: OperationError },

    /// The failure kind is not in the retryable set
    #[error("non-retryable failure on attempt {attempts}: {error}")]
    NonRetryable { attempts: u32, error: OperationError },

    /// The caller cancelled before the next attempt
    #[error("cancelled after {attempts} attempt(s)")]
    Cancelled {
        attempts: u32,
        last_error: Option<OperationError>,
    },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. }
            | RetryError::NonRetryable { attempts, .. }
            | RetryError::Cancelled { attempts, .. } => *attempts,
        }
    }

    pub fn last_error(&self) -> Option<&OperationError> {
        match self {
            RetryError::Exhausted { error, .. } | RetryError::NonRetryable { error, .. } => {
                Some(error)
            }
            RetryError::Cancelled { last_error, .. } => last_error.as_ref(),
        }
    }
}

/// Delay before the attempt following 0-based attempt index `n`, clamped to
/// `max_delay`, without jitter
pub fn backoff_delay(config: &RetryConfig, n: u32) -> Duration {
    let base = config.base_delay;
    let raw = match config.strategy {
        RetryStrategy::Linear => base.checked_mul(n.saturating_add(1)),
        RetryStrategy::Exponential => scale(
            base,
            config
                .backoff_multiplier
                .powi(n.min(i32::MAX as u32) as i32),
        ),
        RetryStrategy::Fibonacci => scale(base, fibonacci(n.saturating_add(1))),
        RetryStrategy::Custom => Some(match config.custom_delays.as_slice() {
            [] => base,
            delays => delays[(n as usize).min(delays.len() - 1)],
        }),
    };

    // overflow means "longer than anything we allow"
    raw.map_or(config.max_delay, |delay| delay.min(config.max_delay))
}

fn scale(base: Duration, factor: f64) -> Option<Duration> {
    // 0 * inf is NaN, and a zero base stays zero however large the factor
    if base.is_zero() {
        return Some(Duration::ZERO);
    }
    Duration::try_from_secs_f64(base.as_secs_f64() * factor).ok()
}

/// Backoff delay with the configured ±10% jitter applied
pub fn retry_delay(config: &RetryConfig, n: u32) -> Duration {
    let delay = backoff_delay(config, n);
    if !config.jitter || delay.is_zero() {
        return delay;
    }

    let secs = delay.as_secs_f64();
    let range = secs * 0.1;
    let offset = rand::thread_rng().gen_range(-range..=range);
    Duration::from_secs_f64((secs + offset).max(0.0))
}

/// `fib(1) = fib(2) = 1`
fn fibonacci(n: u32) -> f64 {
    let (mut a, mut b) = (1.0_f64, 1.0_f64);
    for _ in 2..n {
        (a, b) = (b, a + b);
    }
    if n <= 2 { 1.0 } else { b }
}

/// Executes a fallible async operation up to `max_attempts` times
#[derive(Debug, Clone)]
pub struct RetryMechanism {
    config: RetryConfig,
    clock: Arc<dyn Clock>,
}

impl RetryMechanism {
    pub fn new(config: RetryConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` with retries and no cancellation or attempt recording
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        self.execute_with_retry(operation, |_| {}, &CancellationToken::new())
            .await
    }

    /// Run `operation` with retries
    ///
    /// `on_attempt` receives one record per finished attempt, in order.
    pub async fn execute_with_retry<F, Fut, T, R>(
        &self,
        mut operation: F,
        mut on_attempt: R,
        cancel: &CancellationToken,
    ) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
        R: FnMut(RetryAttemptRecord),
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled {
                    attempts: attempt - 1,
                    last_error,
                });
            }

            let error = match operation().await {
                Ok(value) => {
                    on_attempt(RetryAttemptRecord::success(self.clock.now(), attempt));
                    return Ok(value);
                }
                Err(error) => error,
            };

            on_attempt(RetryAttemptRecord::failure(
                self.clock.now(),
                attempt,
                error.to_string(),
            ));

            if !self.config.is_retryable(&error.kind) {
                debug!(attempt, kind = %error.kind, "failure kind is not retryable");
                return Err(RetryError::NonRetryable {
                    attempts: attempt,
                    error,
                });
            }

            if attempt == max_attempts {
                warn!(attempts = attempt, error = %error, "retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    error,
                });
            }

            let delay = retry_delay(&self.config, attempt - 1);
            debug!(attempt, ?delay, error = %error, "attempt failed, backing off");
            last_error = Some(error);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled {
                        attempts: attempt,
                        last_error,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        // max_attempts >= 1 means the loop always returns
        Err(RetryError::Exhausted {
            attempts: max_attempts,
            error: last_error.unwrap_or_else(|| OperationError::internal("no attempt was made")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::errors::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    fn mechanism(config: RetryConfig) -> RetryMechanism {
        RetryMechanism::new(config, Arc::new(ManualClock::new()))
    }

    #[test]
    fn test_linear_delays() {
        let config = RetryConfig::default()
            .with_strategy(RetryStrategy::Linear)
            .with_base_delay(ms(100))
            .with_jitter(false);

        let delays: Vec<_> = (0..4).map(|n| backoff_delay(&config, n)).collect();
        assert_eq!(delays, vec![ms(100), ms(200), ms(300), ms(400)]);
    }

    #[test]
    fn test_exponential_delays_clamped() {
        let config = RetryConfig::default()
            .with_base_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_max_delay(Duration::from_secs(10))
            .with_jitter(false);

        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(8));
        assert_eq!(backoff_delay(&config, 4), Duration::from_secs(10));
        assert_eq!(backoff_delay(&config, 5000), Duration::from_secs(10));
    }

    #[test]
    fn test_zero_base_delay_stays_zero_for_large_attempts() {
        let exponential = RetryConfig::default()
            .with_base_delay(Duration::ZERO)
            .with_jitter(false);
        let fibonacci = exponential.clone().with_strategy(RetryStrategy::Fibonacci);

        assert_eq!(backoff_delay(&exponential, 3), Duration::ZERO);
        assert_eq!(backoff_delay(&exponential, 1100), Duration::ZERO);
        assert_eq!(backoff_delay(&fibonacci, 1500), Duration::ZERO);
        assert_eq!(retry_delay(&exponential, u32::MAX), Duration::ZERO);
    }

    #[test]
    fn test_fibonacci_delays() {
        let config = RetryConfig::default()
            .with_strategy(RetryStrategy::Fibonacci)
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(false);

        let delays: Vec<u64> = (0..5)
            .map(|n| backoff_delay(&config, n).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 1, 2, 3, 5]);
    }

    #[test]
    fn test_custom_delays_repeat_last() {
        let config = RetryConfig::default()
            .with_custom_delays(vec![ms(1), ms(2), ms(4)])
            .with_jitter(false);

        let delays: Vec<_> = (0..4).map(|n| backoff_delay(&config, n)).collect();
        assert_eq!(delays, vec![ms(1), ms(2), ms(4), ms(4)]);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let config = RetryConfig::default()
            .with_base_delay(Duration::from_secs(1))
            .with_backoff_multiplier(3.0)
            .with_jitter(true);

        for n in 0..4 {
            let expected = backoff_delay(&config, n).as_secs_f64();
            for _ in 0..50 {
                let actual = retry_delay(&config, n).as_secs_f64();
                assert!(
                    (actual - expected).abs() <= expected * 0.1 + 1e-9,
                    "delay {actual} outside ±10% of {expected}"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let retry = mechanism(RetryConfig::default().with_jitter(false));
        let mut records = Vec::new();

        let result = retry
            .execute_with_retry(
                || async { Ok::<_, OperationError>("clicked") },
                |r| records.push(r),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result, Ok("clicked"));
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].attempt_number, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let retry = mechanism(RetryConfig::default().with_max_attempts(5));
        let calls = AtomicU32::new(0);
        let mut records = Vec::new();

        let result = retry
            .execute_with_retry(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(OperationError::timeout("slow"))
                    } else {
                        Ok(42)
                    }
                },
                |r| records.push(r),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let outcomes: Vec<_> = records.iter().map(|r| (r.attempt_number, r.success)).collect();
        assert_eq!(outcomes, vec![(1, false), (2, false), (3, true)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_attempts() {
        let retry = mechanism(RetryConfig::default().with_max_attempts(3));
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = retry
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(OperationError::connection("refused"))
            })
            .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 3,
                error: OperationError::connection("refused"),
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_short_circuits() {
        let retry = mechanism(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_retryable_error(ErrorKind::Timeout),
        );
        let calls = AtomicU32::new(0);
        let mut records = Vec::new();

        let result: Result<(), _> = retry
            .execute_with_retry(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(OperationError::new(ErrorKind::InvalidInput, "bad selector"))
                },
                |r| records.push(r),
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(RetryError::NonRetryable { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
    }

    #[tokio::test]
    async fn test_single_attempt_never_sleeps() {
        // an hour-long delay would hang the test if it were slept
        let retry = mechanism(
            RetryConfig::default()
                .with_max_attempts(1)
                .with_base_delay(Duration::from_secs(3600))
                .with_max_delay(Duration::from_secs(3600)),
        );

        let result: Result<(), _> = retry
            .execute(|| async { Err(OperationError::timeout("t")) })
            .await;

        assert_eq!(result.map_err(|e| e.attempts()), Err(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_follow_schedule() {
        let retry = mechanism(
            RetryConfig::default()
                .with_max_attempts(4)
                .with_custom_delays(vec![ms(100), ms(200), ms(400)])
                .with_jitter(false),
        );
        let started = tokio::time::Instant::now();

        let result: Result<(), _> = retry
            .execute(|| async { Err(OperationError::timeout("t")) })
            .await;

        assert!(result.is_err());
        assert_eq!(started.elapsed(), ms(700));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let retry = mechanism(
            RetryConfig::default()
                .with_max_attempts(5)
                .with_base_delay(Duration::from_secs(10))
                .with_jitter(false),
        );
        let token = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let canceller = {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                token.cancel();
            })
        };

        let result: Result<(), _> = retry
            .execute_with_retry(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(OperationError::timeout("t"))
                },
                |_| {},
                &token,
            )
            .await;

        canceller.await.unwrap();
        assert!(matches!(
            result,
            Err(RetryError::Cancelled { attempts: 1, last_error: Some(_) })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let retry = mechanism(RetryConfig::default());
        let token = CancellationToken::new();
        token.cancel();

        let result: Result<(), _> = retry
            .execute_with_retry(|| async { Ok(()) }, |_| {}, &token)
            .await;

        assert_eq!(
            result,
            Err(RetryError::Cancelled {
                attempts: 0,
                last_error: None
            })
        );
    }
}
