//! Errors for the telemetry lake
use reqwest::StatusCode;
use thiserror::Error;

use crate::models::ChannelKind;

#[derive(Error, Debug)]
pub enum LakeError {
    #[error("MQTT connection failed")]
    MqttConnectionError(#[from] rumqttc::ConnectionError),

    #[error("MQTT client error")]
    MqttClientError(#[from] rumqttc::ClientError),

    #[error("Could not connect to {target} after {attempts} attempts: {reason}")]
    ConnectionError {
        target: &'static str,
        attempts: u32,
        reason: String,
    },

    #[error("Could not decode message: {0}")]
    DecodeError(String),

    #[error("Validation failed: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Persistence error")]
    PersistenceError(#[from] sqlx::Error),

    #[error("Upstream API error: {0}")]
    UpstreamApiError(#[from] ApiError),

    #[error("Configuration error")]
    ConfigError(#[from] config::ConfigError),

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Database migration error")]
    MigrationError(#[from] sqlx::migrate::MigrateError),

    #[error("MQTT event loop task failed: {0}")]
    TaskError(#[from] tokio::task::JoinError),
}

/// Payload rejected by the router.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required field `{field}`")]
    MissingField { field: &'static str },

    #[error("expected {expected} value, got {found}")]
    TypeMismatch {
        expected: ChannelKind,
        found: String,
    },
}

/// Failure talking to the external measurement API.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected response status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl From<serde_json::Error> for LakeError {
    fn from(e: serde_json::Error) -> Self {
        LakeError::DecodeError(e.to_string())
    }
}
