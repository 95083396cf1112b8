//! Remote anomaly scorer client

use crate::config::ScorerConfig;
use crate::error::{Error, Result};
use crate::metrics::{SCORER_DURATION, SCORER_FAILURES};
use crate::retry::{RetryConfig, RetryStrategy};
use crate::types::{Reading, ScoringRequest, ScoringResponse};
use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const MAX_ERROR_BODY: usize = 512;

/// Opaque function from feature vectors to reconstruction errors
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Scorer: Send + Sync {
    /// Score a batch; one reconstruction error per reading is expected
    async fn score(&self, readings: &[Reading]) -> Result<Vec<f64>>;

    /// Liveness check
    async fn health(&self) -> Result<()>;
}

/// JSON-over-HTTP scorer with a bounded retrying transport
pub struct HttpScorer {
    client: reqwest::Client,
    predict_url: String,
    health_url: String,
    retry: RetryStrategy,
}

impl HttpScorer {
    /// Build a client for `config.base_url`
    pub fn new(config: &ScorerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Config(format!("scorer client: {}", e)))?;

        let base = config.base_url.trim_end_matches('/');
        let retry = RetryStrategy::new(RetryConfig {
            max_retries: Some(config.retry_max),
            initial_delay: Duration::from_millis(config.retry_wait_min_ms),
            max_delay: Duration::from_millis(config.retry_wait_max_ms),
            ..RetryConfig::default()
        });

        Ok(Self {
            client,
            predict_url: format!("{}/predict", base),
            health_url: format!("{}/health", base),
            retry,
        })
    }

    async fn post_once(&self, request: &ScoringRequest<'_>) -> Result<ScoringResponse> {
        let response = self
            .client
            .post(&self.predict_url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::ScorerTransport(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            let mut body = response.text().await.unwrap_or_default();
            body.truncate(MAX_ERROR_BODY);
            return Err(Error::ScorerStatus {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<ScoringResponse>()
            .await
            .map_err(|e| Error::ScorerDecode(e.to_string()))
    }
}

/// Transport failures, 5xx (except 501) and 429 are worth another attempt
fn is_retryable(err: &Error) -> bool {
    match err {
        Error::ScorerTransport(_) => true,
        Error::ScorerStatus { status, .. } => {
            *status == 429 || (*status >= 500 && *status != 501)
        }
        _ => false,
    }
}

#[async_trait]
impl Scorer for HttpScorer {
    async fn score(&self, readings: &[Reading]) -> Result<Vec<f64>> {
        let request = ScoringRequest::from_readings(readings);
        let request = &request;
        let start = Instant::now();

        let result = self
            .retry
            .execute_with_retry(
                move || async move { self.post_once(request).await },
                "scorer predict",
                is_retryable,
            )
            .await;

        SCORER_DURATION.observe(start.elapsed().as_secs_f64());
        match result {
            Ok(response) => {
                debug!(
                    batch_size = readings.len(),
                    returned = response.reconstruction_errors.len(),
                    "Scorer responded"
                );
                Ok(response.reconstruction_errors)
            }
            Err(e) => {
                SCORER_FAILURES.with_label_values(&[e.code()]).inc();
                Err(e)
            }
        }
    }

    async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(&self.health_url)
            .send()
            .await
            .map_err(|e| Error::ScorerTransport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::ScorerStatus {
                status: status.as_u16(),
                body: String::new(),
            });
        }
        Ok(())
    }
}

/// Check the scorer until it answers healthy, doubling the wait between checks.
/// Fails with [`Error::ScorerUnhealthy`] once `health_attempts` checks failed.
pub async fn wait_until_healthy(scorer: &dyn Scorer, config: &ScorerConfig) -> Result<()> {
    let attempts = config.health_attempts.max(1);
    let mut backoff = Duration::from_millis(config.health_initial_backoff_ms);

    for attempt in 1..=attempts {
        match scorer.health().await {
            Ok(()) => {
                info!(attempt, "Scorer is healthy");
                return Ok(());
            }
            Err(e) => {
                warn!(attempt, error = %e, "Scorer health check failed");
                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }
    }

    Err(Error::ScorerUnhealthy { attempts })
}
