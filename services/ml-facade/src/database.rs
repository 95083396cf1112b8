use crate::config::DatabaseConfig;
use anyhow::Result;
use async_trait::async_trait;
use facade_core::{Error, PersistedRecord, RecordSink, ResultRecord, SENSOR_COUNT};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::debug;

/// Bind parameters per inserted row
const COLUMNS_PER_ROW: usize = SENSOR_COUNT + 5;

/// Postgres caps a statement at 65535 bind parameters
const ROWS_PER_STATEMENT: usize = u16::MAX as usize / COLUMNS_PER_ROW;

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_seconds))
        .connect(&config.url)
        .await?;

    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

fn insert_prefix() -> String {
    let sensors: Vec<String> = (0..SENSOR_COUNT).map(facade_core::sensor_key).collect();
    format!(
        "INSERT INTO monitoring (machine_id, {}, reconstruction_error, anomaly, anomaly_counter, origin) ",
        sensors.join(", ")
    )
}

/// Writes scored records to the `monitoring` table
#[derive(Clone)]
pub struct PgRecordSink {
    pool: PgPool,
}

impl PgRecordSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn sink_error(err: sqlx::Error) -> Error {
    Error::Sink(err.to_string())
}

#[async_trait]
impl RecordSink for PgRecordSink {
    async fn insert_batch(&self, records: &[ResultRecord]) -> facade_core::Result<Vec<PersistedRecord>> {
        if records.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await.map_err(sink_error)?;
        let mut persisted = Vec::with_capacity(records.len());

        for chunk in records.chunks(ROWS_PER_STATEMENT) {
            let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(insert_prefix());
            builder.push_values(chunk, |mut row, record| {
                row.push_bind(record.reading.machine_id);
                for value in record.reading.sensors.iter() {
                    row.push_bind(*value);
                }
                row.push_bind(record.reconstruction_error)
                    .push_bind(record.anomaly)
                    .push_bind(record.anomaly_counter)
                    .push_bind(record.origin.as_str());
            });
            builder.push(" RETURNING id, created_at");

            let rows = builder
                .build()
                .fetch_all(&mut *tx)
                .await
                .map_err(sink_error)?;

            for row in rows {
                persisted.push(PersistedRecord {
                    id: row.try_get("id").map_err(sink_error)?,
                    created_at: row.try_get("created_at").map_err(sink_error)?,
                });
            }
        }

        tx.commit().await.map_err(sink_error)?;
        debug!(rows = persisted.len(), "Monitoring records inserted");
        Ok(persisted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_prefix_lists_every_column() {
        let prefix = insert_prefix();
        assert!(prefix.starts_with("INSERT INTO monitoring (machine_id, sensor_00, sensor_01"));
        assert!(prefix.contains("sensor_51, reconstruction_error, anomaly, anomaly_counter, origin)"));
        assert_eq!(prefix.matches("sensor_").count(), SENSOR_COUNT);
    }

    #[test]
    fn test_chunk_stays_under_bind_limit() {
        assert!(ROWS_PER_STATEMENT * COLUMNS_PER_ROW <= u16::MAX as usize);
        assert!(ROWS_PER_STATEMENT > 1000);
    }
}
