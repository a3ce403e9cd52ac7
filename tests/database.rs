#![cfg(feature = "integration-tests")]

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use sqlx::PgPool;

use telemetry_lake::{
    config::{RouterConfig, SensorMapping},
    database::{Database, MeasurementStore, TypedSink, TypedTable},
    errors::ApiError,
    fetcher::BatchFetcher,
    ingest::{IngestStats, Outcome, StreamIngester},
    models::{Measurement, Message, TypedRecord, TypedValue},
    openaq::{ApiMeasurement, MeasurementSource},
    router::Router,
};

const STATION: i64 = 17;
const PM25: i64 = 2;

fn at(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, hour, 0, 0).unwrap()
}

fn measurement(hour: u32, value: f64) -> Measurement {
    Measurement {
        entity_id: STATION,
        metric_id: PM25,
        value,
        timestamp_utc: at(hour),
    }
}

/// Upstream returning a fixed page regardless of the requested start
struct FixedSource(Vec<ApiMeasurement>);

impl MeasurementSource for FixedSource {
    fn page_size(&self) -> u32 {
        1000
    }

    async fn fetch_page(
        &self,
        _sensor_id: i64,
        _from: DateTime<Utc>,
        page: u32,
    ) -> Result<Vec<ApiMeasurement>, ApiError> {
        Ok(if page == 1 { self.0.clone() } else { Vec::new() })
    }
}

fn api_page(hours: &[u32]) -> FixedSource {
    FixedSource(
        hours
            .iter()
            .map(|h| ApiMeasurement {
                value: Some(*h as f64 * 1.5),
                period_start: at(*h),
            })
            .collect(),
    )
}

#[sqlx::test(migrations = "./migrations")]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_insert_int_record(pool: PgPool) {
    let db = Database::new(pool.clone());
    let ingester = StreamIngester::new(Router::new(&RouterConfig::default()), db);

    let outcome = ingester
        .process_message(&Message::new("lake/raw/int", r#"{"value": 42}"#))
        .await
        .expect("Failed to store int message");
    assert!(matches!(
        outcome,
        Outcome::Stored {
            table: TypedTable::Int,
            ..
        }
    ));

    let stored: (String, i64, serde_json::Value) =
        sqlx::query_as("SELECT channel, value, payload FROM lake_raw_data_int")
            .fetch_one(&pool)
            .await
            .expect("Failed to retrieve int row");

    assert_eq!(stored.0, "lake/raw/int");
    assert_eq!(stored.1, 42);
    assert_eq!(stored.2, json!({"value": 42}));
}

#[sqlx::test(migrations = "./migrations")]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_insert_float_record(pool: PgPool) {
    let db = Database::new(pool.clone());
    let before = Utc::now() - Duration::seconds(5);

    let stored = db
        .insert_typed(&TypedRecord {
            channel: "lake/raw/float".to_string(),
            raw_payload: json!({"value": 3.14}),
            value: TypedValue::Float(3.14),
        })
        .await
        .expect("Failed to insert float row");
    assert!(stored.recorded_at >= before);

    let value: f64 = sqlx::query_scalar("SELECT value FROM lake_raw_data_float WHERE id = $1")
        .bind(stored.id)
        .fetch_one(&pool)
        .await
        .expect("Failed to retrieve float row");
    assert_eq!(value, 3.14);

    let ints: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM lake_raw_data_int")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(ints, 0);
}

#[sqlx::test(migrations = "./migrations")]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_malformed_message_does_not_block_stream(pool: PgPool) {
    let ingester = StreamIngester::new(
        Router::new(&RouterConfig::default()),
        Database::new(pool.clone()),
    );
    let mut stats = IngestStats::default();

    ingester
        .handle(&Message::new("lake/raw/int", "not json"), &mut stats)
        .await;
    ingester
        .handle(&Message::new("lake/raw/int", r#"{"value": 9.5}"#), &mut stats)
        .await;
    ingester
        .handle(&Message::new("lake/raw/int", r#"{"value": 9.0}"#), &mut stats)
        .await;

    assert_eq!(stats.dropped, 2);
    let values: Vec<i64> = sqlx::query_scalar("SELECT value FROM lake_raw_data_int")
        .fetch_all(&pool)
        .await
        .unwrap();
    assert_eq!(values, vec![9]);
}

#[sqlx::test(migrations = "./migrations")]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_latest_timestamp(pool: PgPool) {
    let db = Database::new(pool);

    assert_eq!(db.latest_timestamp(STATION, PM25).await.unwrap(), None);

    db.insert_measurements(&[measurement(1, 10.0), measurement(3, 12.0), measurement(2, 11.0)])
        .await
        .unwrap();

    assert_eq!(db.latest_timestamp(STATION, PM25).await.unwrap(), Some(at(3)));
    assert_eq!(db.latest_timestamp(STATION, 99).await.unwrap(), None);
}

#[sqlx::test(migrations = "./migrations")]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_insert_measurements_ignores_conflicts(pool: PgPool) {
    let db = Database::new(pool.clone());

    let first = db
        .insert_measurements(&[measurement(1, 10.0), measurement(2, 11.0)])
        .await
        .unwrap();
    // Same key with a different value is skipped, not merged
    let second = db
        .insert_measurements(&[measurement(2, 99.0), measurement(3, 12.0), measurement(3, 12.0)])
        .await
        .unwrap();

    assert_eq!(first, 2);
    assert_eq!(second, 1);

    let value: f64 = sqlx::query_scalar(
        "SELECT value FROM fact_measurements WHERE entity_id = $1 AND metric_id = $2 AND timestamp_utc = $3",
    )
    .bind(STATION)
    .bind(PM25)
    .bind(at(2))
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(value, 11.0);
}

#[sqlx::test(migrations = "./migrations")]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_fetch_passes_with_overlap(pool: PgPool) {
    let sensors = vec![SensorMapping {
        sensor_id: 3917,
        entity_id: STATION,
        metric_id: PM25,
    }];
    let now = at(23);

    let first = BatchFetcher::new(
        Database::new(pool.clone()),
        api_page(&[1, 2, 3]),
        sensors.clone(),
        Duration::days(7),
    );
    assert_eq!(first.run_at(now).await.unwrap().inserted, 3);

    let second = BatchFetcher::new(
        Database::new(pool.clone()),
        api_page(&[3, 4]),
        sensors.clone(),
        Duration::days(7),
    );
    let summary = second.run_at(now).await.unwrap();
    assert_eq!(summary.fetched, 2);
    assert_eq!(summary.inserted, 1);

    let again = second.run_at(now).await.unwrap();
    assert_eq!(again.inserted, 0);

    let stored: Vec<DateTime<Utc>> = sqlx::query_scalar(
        "SELECT timestamp_utc FROM fact_measurements ORDER BY timestamp_utc",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(stored, vec![at(1), at(2), at(3), at(4)]);
}

#[sqlx::test(migrations = "./migrations")]
#[cfg_attr(not(feature = "integration-tests"), ignore)]
async fn test_reference_lookup(pool: PgPool) {
    sqlx::query("INSERT INTO dim_entities (id, name, location) VALUES ($1, $2, $3)")
        .bind(STATION)
        .bind("Centro")
        .bind("Mérida, MX")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO dim_metrics (id, display_name, units) VALUES ($1, $2, $3)")
        .bind(PM25)
        .bind("PM2.5")
        .bind("µg/m³")
        .execute(&pool)
        .await
        .unwrap();

    let db = Database::new(pool);
    let entity = db.entity(STATION).await.unwrap().unwrap();
    let metric = db.metric(PM25).await.unwrap().unwrap();

    assert_eq!(entity.name, "Centro");
    assert_eq!(entity.metadata, None);
    assert_eq!(metric.display_name, "PM2.5");
    assert_eq!(metric.units.as_deref(), Some("µg/m³"));
    assert!(db.metric(404).await.unwrap().is_none());
}
