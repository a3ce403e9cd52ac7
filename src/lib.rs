//! Telemetry lake: stream and batch ingestion of sensor data into PostgreSQL

pub mod config;
pub mod database;
pub mod errors;
pub mod fetcher;
pub mod ingest;
pub mod models;
pub mod mqtt;
pub mod openaq;
pub mod router;
pub mod watermark;

/// Initialize logging from `RUST_LOG`
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
}

/// Load `.env` into the environment before configuration is read
#[cfg(feature = "dotenvy")]
pub fn load_dotenv() {
    if let Err(e) = dotenvy::dotenv() {
        tracing::debug!("No .env file loaded: {}", e);
    }
}

#[cfg(not(feature = "dotenvy"))]
pub fn load_dotenv() {}
