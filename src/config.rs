//! Application configuration

use std::collections::HashSet;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;

use crate::errors::LakeError;
use crate::models::ChannelKind;
use crate::watermark::DEFAULT_LOOKBACK_DAYS;

/// Largest page the measurement API will serve
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Upper bound on the fetcher lookback, about ten years
pub const MAX_LOOKBACK_DAYS: i64 = 3650;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Only needed by the subscriber
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub router: RouterConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub fetcher: FetcherConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum MqttTransport {
    #[default]
    Tcp,
    Tls,
    Wss,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    /// Broker host name, or the full `wss://` URL for websocket transport
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,
    #[serde(default)]
    pub transport: MqttTransport,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_keep_alive")]
    pub keep_alive: Duration,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Duration,
    /// Keep the broker session across reconnects so unacknowledged
    /// messages are redelivered
    #[serde(default)]
    pub clean_session: bool,
}

/// Static channel to value kind binding
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ChannelSpec {
    pub topic: String,
    pub kind: ChannelKind,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouterConfig {
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelSpec>,
    /// Type channels missing from `channels` by their `*/int`, `*/float` suffix
    #[serde(default = "default_true")]
    pub infer_from_suffix: bool,
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_connect_retries")]
    pub connect_retries: u32,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_retry_delay")]
    pub retry_delay: Duration,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// External sensor mapped onto an (entity, metric) pair
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct SensorMapping {
    pub sensor_id: i64,
    pub entity_id: i64,
    pub metric_id: i64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FetcherConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_lookback_days")]
    pub lookback_days: i64,
    #[serde(default)]
    pub sensors: Vec<SensorMapping>,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "lake_subscriber".to_string()
}

fn default_topics() -> Vec<String> {
    vec!["lake/raw/#".to_string()]
}

fn default_keep_alive() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_retries() -> u32 {
    5
}

fn default_retry_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_max_connections() -> u32 {
    5
}

fn default_true() -> bool {
    true
}

fn default_channels() -> Vec<ChannelSpec> {
    vec![
        ChannelSpec {
            topic: "lake/raw/int".to_string(),
            kind: ChannelKind::Int,
        },
        ChannelSpec {
            topic: "lake/raw/float".to_string(),
            kind: ChannelKind::Float,
        },
    ]
}

fn default_base_url() -> String {
    "https://api.openaq.org".to_string()
}

fn default_page_size() -> u32 {
    MAX_PAGE_SIZE
}

fn default_lookback_days() -> i64 {
    DEFAULT_LOOKBACK_DAYS
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            client_id: default_client_id(),
            username: None,
            password: None,
            topics: default_topics(),
            transport: MqttTransport::default(),
            keep_alive: default_keep_alive(),
            connect_retries: default_connect_retries(),
            retry_delay: default_retry_delay(),
            clean_session: false,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            channels: default_channels(),
            infer_from_suffix: true,
        }
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            page_size: default_page_size(),
            lookback_days: default_lookback_days(),
            sensors: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/default")
    }

    /// Load from the given config file (optional, any format `config`
    /// understands) overlaid with `LAKE__*` environment variables
    pub fn load_from(file: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix("LAKE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("mqtt.topics"),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the sections used by the streaming subscriber
    pub fn validate_subscriber(&self) -> Result<(), LakeError> {
        self.mqtt.validate()?;
        self.router.validate()?;
        self.database.validate()?;
        Ok(())
    }

    /// Validate the sections used by the batch fetcher
    pub fn validate_fetcher(&self) -> Result<(), LakeError> {
        self.database.validate()?;
        self.fetcher.validate()?;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> LakeError {
    LakeError::ConfigurationError {
        message: message.into(),
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Result<(), LakeError> {
        if self.host.trim().is_empty() {
            return Err(invalid("MQTT host cannot be empty"));
        }
        if self.port == 0 {
            return Err(invalid("MQTT port must be greater than zero"));
        }
        if self.topics.is_empty() || self.topics.iter().any(|t| t.is_empty()) {
            return Err(invalid("At least one non-empty MQTT topic is required"));
        }
        if self.connect_retries == 0 {
            return Err(invalid("MQTT connect retries must be greater than zero"));
        }
        Ok(())
    }

    /// Credentials are only passed on when both halves are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

impl RouterConfig {
    pub fn validate(&self) -> Result<(), LakeError> {
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.topic.is_empty() {
                return Err(invalid("Channel topic cannot be empty"));
            }
            if !seen.insert(channel.topic.as_str()) {
                return Err(invalid(format!(
                    "Channel {} is declared more than once",
                    channel.topic
                )));
            }
        }
        Ok(())
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> Result<(), LakeError> {
        if self.url.trim().is_empty() {
            return Err(invalid("Database URL cannot be empty"));
        }
        if self.max_connections == 0 {
            return Err(invalid("Database max connections must be greater than zero"));
        }
        if self.connect_retries == 0 {
            return Err(invalid("Database connect retries must be greater than zero"));
        }
        Ok(())
    }
}

impl FetcherConfig {
    pub fn validate(&self) -> Result<(), LakeError> {
        if self.base_url.trim().is_empty() {
            return Err(invalid("Fetcher base URL cannot be empty"));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(invalid(format!(
                "Fetcher page size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if self.lookback_days <= 0 || self.lookback_days > MAX_LOOKBACK_DAYS {
            return Err(invalid(format!(
                "Fetcher lookback must be between 1 and {} days",
                MAX_LOOKBACK_DAYS
            )));
        }
        let mut seen = HashSet::new();
        for sensor in &self.sensors {
            if !seen.insert(sensor.sensor_id) {
                return Err(invalid(format!(
                    "Sensor {} is mapped more than once",
                    sensor.sensor_id
                )));
            }
        }
        Ok(())
    }

    pub fn lookback(&self) -> Result<chrono::Duration, LakeError> {
        chrono::Duration::try_days(self.lookback_days).ok_or_else(|| {
            invalid(format!(
                "Fetcher lookback of {} days is out of range",
                self.lookback_days
            ))
        })
    }
}
