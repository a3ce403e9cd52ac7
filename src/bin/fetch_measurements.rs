//! One incremental pass of the measurement API into `fact_measurements`

use telemetry_lake::{
    config::AppConfig, database::Database, errors::LakeError, fetcher::BatchFetcher,
    openaq::OpenAqClient,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), LakeError> {
    telemetry_lake::load_dotenv();
    telemetry_lake::init_tracing();

    let config = AppConfig::load()?;
    config.validate_fetcher()?;

    let db = Database::connect(&config.database).await?;
    if config.database.run_migrations {
        db.migrate().await?;
    }

    if config.fetcher.sensors.is_empty() {
        warn!("No sensors configured, nothing to fetch");
    }
    for sensor in &config.fetcher.sensors {
        let entity = db.entity(sensor.entity_id).await?;
        let metric = db.metric(sensor.metric_id).await?;
        match (entity, metric) {
            (Some(entity), Some(metric)) => info!(
                "Sensor {}: {} at {}, {} [{}]",
                sensor.sensor_id,
                metric.display_name,
                entity.name,
                metric.units.as_deref().unwrap_or("-"),
                entity.location.as_deref().unwrap_or("unknown location"),
            ),
            _ => warn!(
                sensor_id = sensor.sensor_id,
                entity_id = sensor.entity_id,
                metric_id = sensor.metric_id,
                "Sensor maps to an entity or metric missing from reference data"
            ),
        }
    }

    let fetcher = BatchFetcher::new(
        db.clone(),
        OpenAqClient::new(&config.fetcher),
        config.fetcher.sensors.clone(),
        config.fetcher.lookback()?,
    );

    let result = fetcher.run().await;
    db.close().await;

    match result {
        Ok(summary) => {
            info!(
                pairs = summary.pairs_attempted,
                failed = summary.pairs_failed,
                fetched = summary.fetched,
                inserted = summary.inserted,
                "Fetch run completed"
            );
            Ok(())
        }
        Err(e) => {
            error!("Fetch run aborted: {}", e);
            Err(e)
        }
    }
}
