//! Streaming subscriber: MQTT topics into the typed raw tables

use telemetry_lake::{
    config::AppConfig,
    database::Database,
    errors::LakeError,
    ingest::StreamIngester,
    mqtt::MqttClientBuilder,
    router::Router,
};
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), LakeError> {
    telemetry_lake::load_dotenv();
    telemetry_lake::init_tracing();

    let config = AppConfig::load()?;
    config.validate_subscriber()?;

    info!(
        "Starting subscriber: broker={}:{}, topics={:?}",
        config.mqtt.host, config.mqtt.port, config.mqtt.topics
    );

    let db = Database::connect(&config.database).await?;
    if config.database.run_migrations {
        db.migrate().await?;
    }

    let mqtt_client = MqttClientBuilder::new(&config.mqtt)?.connect().await?;

    let ingester = StreamIngester::new(Router::new(&config.router), db.clone());

    // Ctrl-C ends the loop, after which the client disconnects cleanly
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Could not listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let result = ingester.run(mqtt_client, shutdown).await;
    db.close().await;

    match result {
        Ok(stats) => {
            info!("Subscriber completed: {:?}", stats);
            Ok(())
        }
        Err(e) => {
            error!("Subscriber failed: {}", e);
            Err(e)
        }
    }
}
