//! Scoring orchestrator - the decision pipeline shared by both ingestion paths
//!
//! ```text
//! BatchSource ─► normalize ─► scorer ─► align ─► threshold/counter ─► sink
//! ```

use crate::broker::Delivery;
use crate::cache::ThresholdCache;
use crate::error::{Error, Result};
use crate::intake::BatchProcessor;
use crate::metrics::{ANOMALIES, BATCHES_FAILED, BATCH_SIZE, COUNTER_VALUE};
use crate::scorer::Scorer;
use crate::sink::RecordSink;
use crate::store::ThresholdStore;
use crate::types::{MachineId, Origin, PersistedRecord, Reading, ResultRecord};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// Where a batch of readings comes from
#[derive(Debug, Clone)]
pub enum BatchSource {
    /// One request body holding a JSON array of readings
    Payload {
        /// Declared content type, if any
        content_type: Option<String>,
        /// Raw body
        body: Bytes,
    },
    /// Broker deliveries, one JSON reading each, in delivery order
    Deliveries(Vec<Delivery>),
}

impl BatchSource {
    /// JSON payload without a declared content type
    pub fn json(body: impl Into<Bytes>) -> Self {
        BatchSource::Payload {
            content_type: None,
            body: body.into(),
        }
    }

    /// Decode into an ordered batch. Any bad item rejects the whole batch.
    pub fn normalize(self) -> Result<Vec<Reading>> {
        let readings = match self {
            BatchSource::Payload { content_type, body } => {
                ensure_json(content_type.as_deref())?;
                let items: Vec<serde_json::Value> = serde_json::from_slice(&body)?;
                items
                    .into_iter()
                    .enumerate()
                    .map(|(index, item)| {
                        serde_json::from_value::<Reading>(item).map_err(|e| {
                            Error::MalformedReading {
                                index,
                                reason: e.to_string(),
                            }
                        })
                    })
                    .collect::<Result<Vec<_>>>()?
            }
            BatchSource::Deliveries(deliveries) => deliveries
                .iter()
                .enumerate()
                .map(|(index, delivery)| {
                    ensure_json(delivery.content_type.as_deref())?;
                    serde_json::from_slice::<Reading>(&delivery.payload).map_err(|e| {
                        Error::MalformedReading {
                            index,
                            reason: e.to_string(),
                        }
                    })
                })
                .collect::<Result<Vec<_>>>()?,
        };

        if readings.is_empty() {
            return Err(Error::EmptyBatch);
        }
        Ok(readings)
    }
}

fn ensure_json(content_type: Option<&str>) -> Result<()> {
    match content_type {
        None => Ok(()),
        Some(ct) if ct.trim().is_empty() => Ok(()),
        Some(ct) => {
            let essence = ct.split(';').next().unwrap_or_default().trim();
            if essence.eq_ignore_ascii_case("application/json") || essence.ends_with("+json") {
                Ok(())
            } else {
                Err(Error::UnsupportedSource(ct.to_string()))
            }
        }
    }
}

/// Result of scoring one batch
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreOutcome {
    /// One reconstruction error per reading, in batch order
    pub reconstruction_errors: Vec<f64>,
    /// Counter produced by the last reading in batch order
    pub final_counter: i64,
    /// Resulting counter per machine present in the batch
    pub counters: BTreeMap<MachineId, i64>,
    /// Identities assigned by the sink, in batch order
    pub records: Vec<PersistedRecord>,
}

/// Shared decision core
pub struct ScoringOrchestrator {
    scorer: Arc<dyn Scorer>,
    cache: Arc<ThresholdCache>,
    store: Arc<dyn ThresholdStore>,
    sink: Arc<dyn RecordSink>,
    per_machine_metrics: bool,
}

impl ScoringOrchestrator {
    /// Wire the pipeline
    pub fn new(
        scorer: Arc<dyn Scorer>,
        cache: Arc<ThresholdCache>,
        store: Arc<dyn ThresholdStore>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            scorer,
            cache,
            store,
            sink,
            per_machine_metrics: false,
        }
    }

    /// Feed the per-machine counter gauge
    pub fn with_per_machine_metrics(mut self, enabled: bool) -> Self {
        self.per_machine_metrics = enabled;
        self
    }

    /// Threshold store behind the pipeline
    pub fn store(&self) -> &Arc<dyn ThresholdStore> {
        &self.store
    }

    /// Score one batch end to end
    pub async fn score(&self, source: BatchSource, origin: Origin) -> Result<ScoreOutcome> {
        match self.run(source, origin).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                BATCHES_FAILED
                    .with_label_values(&[origin.as_str(), e.code()])
                    .inc();
                Err(e)
            }
        }
    }

    async fn run(&self, source: BatchSource, origin: Origin) -> Result<ScoreOutcome> {
        let readings = source.normalize()?;
        BATCH_SIZE
            .with_label_values(&[origin.as_str()])
            .observe(readings.len() as f64);

        let errors = self.scorer.score(&readings).await?;
        if errors.len() != readings.len() {
            return Err(Error::LengthMismatch {
                expected: readings.len(),
                actual: errors.len(),
            });
        }

        // Every threshold is resolved before the first counter moves, so a
        // batch with an unknown machine fails without touching the store.
        let mut thresholds: HashMap<MachineId, f64> = HashMap::new();
        for reading in &readings {
            if !thresholds.contains_key(&reading.machine_id) {
                let threshold = self.cache.get(reading.machine_id).await?;
                thresholds.insert(reading.machine_id, threshold);
            }
        }

        let mut records = Vec::with_capacity(readings.len());
        let mut counters = BTreeMap::new();
        let mut final_counter = 0;

        for (reading, reconstruction_error) in readings.into_iter().zip(errors.iter().copied()) {
            let machine_id = reading.machine_id;
            let threshold = thresholds[&machine_id];
            let anomaly = reconstruction_error > threshold;

            let counter = if anomaly {
                ANOMALIES.with_label_values(&[origin.as_str()]).inc();
                self.store.increment_counter(machine_id).await?
            } else {
                self.store.decrement_counter(machine_id).await?
            };

            debug!(
                machine_id,
                reconstruction_error, threshold, anomaly, counter, "Reading scored"
            );
            if self.per_machine_metrics {
                COUNTER_VALUE
                    .with_label_values(&[&machine_id.to_string()])
                    .set(counter);
            }

            counters.insert(machine_id, counter);
            final_counter = counter;
            records.push(ResultRecord {
                reading,
                reconstruction_error,
                anomaly,
                anomaly_counter: counter,
                origin,
            });
        }

        let persisted = self.sink.insert_batch(&records).await?;

        Ok(ScoreOutcome {
            reconstruction_errors: errors,
            final_counter,
            counters,
            records: persisted,
        })
    }
}

#[async_trait]
impl BatchProcessor for ScoringOrchestrator {
    async fn process(&self, batch: Vec<Delivery>) -> Result<()> {
        let batch_size = batch.len();
        let outcome = self
            .score(BatchSource::Deliveries(batch), Origin::Queue)
            .await?;
        info!(
            batch_size,
            final_counter = outcome.final_counter,
            machines = outcome.counters.len(),
            "Queue batch scored"
        );
        Ok(())
    }
}
