//! Record sink interface

use crate::error::{Error, Result};
use crate::types::{PersistedRecord, ResultRecord};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Mutex;

/// Persists scored records. A batch is written as a whole or not at all.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Persist `records`, returning one identity per record in input order
    async fn insert_batch(&self, records: &[ResultRecord]) -> Result<Vec<PersistedRecord>>;
}

/// Sink keeping records in memory, with sequential ids
#[derive(Default)]
pub struct InMemoryRecordSink {
    records: Mutex<Vec<(PersistedRecord, ResultRecord)>>,
}

impl InMemoryRecordSink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything persisted so far
    pub fn records(&self) -> Vec<ResultRecord> {
        self.records
            .lock()
            .map(|rows| rows.iter().map(|(_, r)| r.clone()).collect())
            .unwrap_or_default()
    }

    /// Number of persisted records
    pub fn len(&self) -> usize {
        self.records.lock().map(|rows| rows.len()).unwrap_or(0)
    }

    /// True when nothing has been persisted
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordSink for InMemoryRecordSink {
    async fn insert_batch(&self, records: &[ResultRecord]) -> Result<Vec<PersistedRecord>> {
        let mut rows = self
            .records
            .lock()
            .map_err(|e| Error::Sink(e.to_string()))?;

        let now = Utc::now();
        let persisted: Vec<PersistedRecord> = (0..records.len())
            .map(|i| PersistedRecord {
                id: (rows.len() + i + 1) as i64,
                created_at: now,
            })
            .collect();

        rows.extend(persisted.iter().copied().zip(records.iter().cloned()));
        Ok(persisted)
    }
}
