//! PostgreSQL persistence for typed telemetry and measurements

mod models;
mod types;

use std::future::Future;

use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPoolOptions, types::Json, PgPool};
use tracing::{error, info, warn};

pub use models::StoredRecord;
pub use types::TypedTable;

use crate::{
    config::DatabaseConfig,
    errors::LakeError,
    models::{Entity, Measurement, Metric, TypedRecord, TypedValue},
};

/// Append-only destination for routed stream messages
pub trait TypedSink {
    /// Insert one record into the table matching its value kind
    fn insert_typed(
        &self,
        record: &TypedRecord,
    ) -> impl Future<Output = Result<StoredRecord, sqlx::Error>> + Send;
}

/// Measurement table as seen by the batch fetcher
pub trait MeasurementStore {
    /// Latest stored `timestamp_utc` for the pair, `None` if nothing is stored
    fn latest_timestamp(
        &self,
        entity_id: i64,
        metric_id: i64,
    ) -> impl Future<Output = Result<Option<DateTime<Utc>>, sqlx::Error>> + Send;

    /// Insert rows, skipping any that already exist. Returns rows inserted.
    fn insert_measurements(
        &self,
        measurements: &[Measurement],
    ) -> impl Future<Output = Result<u64, sqlx::Error>> + Send;
}

/// Owned handle to the telemetry database
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the configured database, retrying with a fixed delay.
    ///
    /// Only used at startup: failure after the last attempt is fatal.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, LakeError> {
        config.validate()?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(&config.url)
                .await;

            match result {
                Ok(pool) => {
                    info!("Connected to database on attempt {}", attempt);
                    return Ok(Self::new(pool));
                }
                Err(e) if attempt < config.connect_retries => {
                    warn!(
                        attempt,
                        max_attempts = config.connect_retries,
                        error = %e,
                        "Database not reachable, retrying in {:?}",
                        config.retry_delay
                    );
                    tokio::time::sleep(config.retry_delay).await;
                }
                Err(e) => {
                    error!(attempts = attempt, error = %e, "Giving up on database connection");
                    return Err(LakeError::ConnectionError {
                        target: "database",
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), LakeError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Look up a monitoring entity
    pub async fn entity(&self, id: i64) -> Result<Option<Entity>, LakeError> {
        let entity = sqlx::query_as::<_, Entity>(
            "SELECT id, name, location, metadata FROM dim_entities WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(entity)
    }

    /// Look up a measured parameter
    pub async fn metric(&self, id: i64) -> Result<Option<Metric>, LakeError> {
        let metric = sqlx::query_as::<_, Metric>(
            "SELECT id, display_name, units FROM dim_metrics WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(metric)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl TypedSink for Database {
    async fn insert_typed(&self, record: &TypedRecord) -> Result<StoredRecord, sqlx::Error> {
        let table = TypedTable::for_value(&record.value);
        let sql = format!(
            "INSERT INTO {} (channel, payload, value) VALUES ($1, $2, $3)
             RETURNING id, recorded_at",
            table.name()
        );

        let query = sqlx::query_as::<_, StoredRecord>(&sql)
            .bind(&record.channel)
            .bind(Json(&record.raw_payload));

        let query = match record.value {
            TypedValue::Int(v) => query.bind(v),
            TypedValue::Float(v) => query.bind(v),
        };

        query.fetch_one(&self.pool).await
    }
}

impl MeasurementStore for Database {
    async fn latest_timestamp(
        &self,
        entity_id: i64,
        metric_id: i64,
    ) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            "SELECT MAX(timestamp_utc) FROM fact_measurements
             WHERE entity_id = $1 AND metric_id = $2",
        )
        .bind(entity_id)
        .bind(metric_id)
        .fetch_one(&self.pool)
        .await
    }

    async fn insert_measurements(&self, measurements: &[Measurement]) -> Result<u64, sqlx::Error> {
        if measurements.is_empty() {
            return Ok(0);
        }

        let mut entity_ids = Vec::with_capacity(measurements.len());
        let mut metric_ids = Vec::with_capacity(measurements.len());
        let mut values = Vec::with_capacity(measurements.len());
        let mut timestamps = Vec::with_capacity(measurements.len());
        for m in measurements {
            entity_ids.push(m.entity_id);
            metric_ids.push(m.metric_id);
            values.push(m.value);
            timestamps.push(m.timestamp_utc);
        }

        let result = sqlx::query(
            "INSERT INTO fact_measurements (entity_id, metric_id, value, timestamp_utc)
             SELECT * FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::DOUBLE PRECISION[], $4::TIMESTAMPTZ[])
             ON CONFLICT (entity_id, metric_id, timestamp_utc) DO NOTHING",
        )
        .bind(entity_ids)
        .bind(metric_ids)
        .bind(values)
        .bind(timestamps)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}
