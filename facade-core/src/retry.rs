//! Retry strategy - exponential backoff with optional jitter for broker and scorer retries

use crate::error::{Error, Result};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Backoff schedule
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt; `None` retries forever
    pub max_retries: Option<u32>,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Delay cap
    pub max_delay: Duration,
    /// Growth factor per failed attempt
    pub backoff_multiplier: f64,
    /// Relative jitter (0.1 = ±10%)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    /// Unbounded doubling schedule used for broker reconnects
    pub fn unbounded(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries: None,
            initial_delay,
            max_delay,
            ..Self::default()
        }
    }
}

/// Retry driver over a [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    config: RetryConfig,
}

impl RetryStrategy {
    /// Create a strategy
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Active schedule
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// True once `attempt` failed attempts have used up the budget
    pub fn exhausted(&self, attempt: u32) -> bool {
        matches!(self.config.max_retries, Some(max) if attempt > max)
    }

    /// Delay before retry number `attempt + 1`, capped at `max_delay`
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay = self.config.initial_delay.as_millis() as f64
            * self.config.backoff_multiplier.powi(attempt.min(32) as i32);

        let capped_delay = base_delay.min(self.config.max_delay.as_millis() as f64);

        let final_delay = if self.config.jitter_factor > 0.0 {
            let jitter_range = capped_delay * self.config.jitter_factor;
            let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
            (capped_delay + jitter).max(0.0)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }

    /// Execute operation with retry logic
    pub async fn execute_with_retry<F, Fut, T, R>(
        &self,
        operation: F,
        operation_name: &str,
        is_retryable: R,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
        R: Fn(&Error) -> bool,
    {
        let mut attempt = 0u32;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(
                            "Operation {} succeeded on retry attempt {}",
                            operation_name, attempt
                        );
                    }
                    return Ok(result);
                }
                Err(e) => {
                    if !is_retryable(&e) {
                        return Err(e);
                    }

                    attempt += 1;
                    if self.exhausted(attempt) {
                        warn!(
                            "Giving up on {} after {} attempts: {}",
                            operation_name, attempt, e
                        );
                        return Err(e);
                    }

                    let delay = self.calculate_delay(attempt - 1);
                    warn!(
                        "Attempt {} failed for {}: {}, retrying in {:?}",
                        attempt, operation_name, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Sleep for `delay` unless `token` fires first. Returns false when cancelled.
pub async fn sleep_or_cancel(delay: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn strategy(max_retries: Option<u32>, initial_ms: u64, max_ms: u64) -> RetryStrategy {
        RetryStrategy::new(RetryConfig {
            max_retries,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        })
    }

    #[test]
    fn test_exponential_backoff() {
        let strategy = strategy(Some(3), 1000, 10000);

        assert_eq!(strategy.calculate_delay(0).as_millis(), 1000);
        assert_eq!(strategy.calculate_delay(1).as_millis(), 2000);
        assert_eq!(strategy.calculate_delay(2).as_millis(), 4000);
    }

    #[test]
    fn test_max_delay_cap() {
        let strategy = strategy(None, 5000, 60000);

        assert_eq!(strategy.calculate_delay(3).as_millis(), 40000);
        assert_eq!(strategy.calculate_delay(4).as_millis(), 60000);
        assert_eq!(strategy.calculate_delay(100).as_millis(), 60000);
    }

    #[test]
    fn test_unbounded_never_exhausted() {
        let strategy = strategy(None, 1, 2);
        assert!(!strategy.exhausted(u32::MAX));

        let bounded = strategy_bounded();
        assert!(!bounded.exhausted(2));
        assert!(bounded.exhausted(3));
    }

    fn strategy_bounded() -> RetryStrategy {
        strategy(Some(2), 1, 2)
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let result = strategy(Some(5), 10, 100)
            .execute_with_retry(
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::ScorerTransport("refused".into()))
                    } else {
                        Ok(42)
                    }
                },
                "test",
                |_| true,
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_exhausted() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = strategy(Some(2), 10, 100)
            .execute_with_retry(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::ScorerTransport("refused".into()))
                },
                "test",
                |_| true,
            )
            .await;

        assert!(matches!(result, Err(Error::ScorerTransport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = strategy(Some(5), 10, 100)
            .execute_with_retry(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::ScorerDecode("bad body".into()))
                },
                "test",
                |e| matches!(e, Error::ScorerTransport(_)),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_aborts_on_cancel() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(3600), &token).await);
    }
}
