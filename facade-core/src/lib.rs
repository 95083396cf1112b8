//! # ML Facade Core
//!
//! Ingestion-and-decision engine sitting between sensor-emitting machines and a
//! remote anomaly scorer:
//! - One scoring pipeline shared by the synchronous and the queue path
//! - Bounded-concurrency batch intake over a durable broker queue
//! - Broker connection supervision with exponential backoff
//! - Per-machine threshold cache with a fixed TTL
//! - Atomic, clamped adaptive counter held in the key-value store
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (one payload)            Broker deliveries
//!          │                             │
//!          │                  ┌──────────▼───────────┐
//!          │                  │ ConnectionSupervisor │
//!          │                  └──────────┬───────────┘
//!          │                  ┌──────────▼───────────┐
//!          │                  │   BatchIntakeLoop    │──► N bounded workers
//!          │                  └──────────┬───────────┘
//!          │                             │
//! ┌────────▼─────────────────────────────▼────────────┐
//! │                ScoringOrchestrator                 │
//! │ normalize → scorer → align → threshold → counter   │
//! └────────┬──────────────┬────────────────┬──────────┘
//!          │              │                │
//!   Remote scorer   ThresholdCache /   RecordSink
//!                   ThresholdStore
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod broker;
pub mod cache;
pub mod config;
pub mod error;
pub mod facade;
pub mod intake;
pub mod metrics;
pub mod orchestrator;
pub mod retry;
pub mod scorer;
pub mod sink;
pub mod store;
pub mod supervisor;
pub mod types;

pub use broker::{BrokerConnector, BrokerSession, Delivery, NatsConnector};
pub use cache::ThresholdCache;
pub use config::{BrokerConfig, CacheConfig, IntakeConfig, MetricsConfig, ScorerConfig};
pub use error::{Error, ErrorClass, Result};
pub use facade::FacadeService;
pub use intake::{BatchIntakeLoop, BatchProcessor, IntakeExit};
pub use orchestrator::{BatchSource, ScoreOutcome, ScoringOrchestrator};
pub use scorer::{wait_until_healthy, HttpScorer, Scorer};
pub use sink::{InMemoryRecordSink, RecordSink};
pub use store::{InMemoryThresholdStore, RedisThresholdStore, ThresholdStore};
pub use supervisor::{ConnectionSupervisor, SupervisorState};
pub use types::*;

/// Number of sensor features carried by every reading
pub const SENSOR_COUNT: usize = 52;

/// Upper bound of the adaptive counter
pub const COUNTER_MAX: i64 = 20;

/// Lower bound of the adaptive counter
pub const COUNTER_MIN: i64 = 0;

/// Default threshold cache TTL (seconds)
pub const DEFAULT_THRESHOLD_TTL_SECONDS: u64 = 60;
