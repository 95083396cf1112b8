//! Configuration for the facade core components

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Broker connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Start the queue path at all
    pub enabled: bool,

    /// Broker URL
    pub url: String,

    /// Durable stream name
    pub stream: String,

    /// Subject the readings are published on
    pub subject: String,

    /// Durable consumer name
    pub durable_name: String,

    /// First reconnect delay (milliseconds)
    pub initial_backoff_ms: u64,

    /// Reconnect delay cap (milliseconds)
    pub max_backoff_ms: u64,

    /// Dial timeout (milliseconds)
    pub connect_timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "nats://localhost:4222".to_string(),
            stream: "SENSOR_READINGS".to_string(),
            subject: "sensors.readings".to_string(),
            durable_name: "ml-facade".to_string(),
            initial_backoff_ms: 5_000, // 5 seconds
            max_backoff_ms: 60_000,    // 1 minute
            connect_timeout_ms: 5_000,
        }
    }
}

impl BrokerConfig {
    /// First reconnect delay
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Reconnect delay cap
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Batch intake configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Maximum batches processed concurrently
    pub workers: usize,

    /// Deliveries per batch
    pub batch_size: usize,

    /// Batch window (milliseconds)
    pub batch_timeout_ms: u64,
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            batch_size: 5,
            batch_timeout_ms: 50,
        }
    }
}

impl IntakeConfig {
    /// Batch window
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }
}

/// Remote scorer client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    /// Scorer base URL (`/predict` and `/health` are appended)
    pub base_url: String,

    /// Per-request timeout (milliseconds)
    pub request_timeout_ms: u64,

    /// Retries after the first attempt
    pub retry_max: u32,

    /// Smallest wait between retries (milliseconds)
    pub retry_wait_min_ms: u64,

    /// Largest wait between retries (milliseconds)
    pub retry_wait_max_ms: u64,

    /// Health checks before startup gives up
    pub health_attempts: u32,

    /// First wait between health checks (milliseconds)
    pub health_initial_backoff_ms: u64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout_ms: 5_000,
            retry_max: 5,
            retry_wait_min_ms: 10,
            retry_wait_max_ms: 100,
            health_attempts: 3,
            health_initial_backoff_ms: 1_000,
        }
    }
}

impl ScorerConfig {
    /// Per-request timeout
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Threshold cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a cached threshold (seconds)
    pub threshold_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            threshold_ttl_seconds: crate::DEFAULT_THRESHOLD_TTL_SECONDS,
        }
    }
}

impl CacheConfig {
    /// Lifetime of a cached threshold
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.threshold_ttl_seconds)
    }
}

/// Metrics configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Export the adaptive counter gauge per machine. Series count grows with
    /// the fleet, so this stays off unless the fleet is small.
    pub per_machine_counters: bool,
}
