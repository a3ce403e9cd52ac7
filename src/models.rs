//! Data models.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Value type a channel is declared to carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Int,
    Float,
}

impl ChannelKind {
    /// Kind implied by the last topic level, `*/int` or `*/float`
    pub fn from_topic_suffix(topic: &str) -> Option<Self> {
        match topic.rsplit('/').next()? {
            "int" => Some(ChannelKind::Int),
            "float" => Some(ChannelKind::Float),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Int => write!(f, "int"),
            ChannelKind::Float => write!(f, "float"),
        }
    }
}

/// A single broker delivery, alive only while it is being processed
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub channel: String,
    pub payload: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl Message {
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }
}

/// The `value` field of a payload, classified once
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PayloadValue {
    Int(i64),
    Float(f64),
    /// Present but not a number; holds the JSON type name
    Invalid(&'static str),
}

impl PayloadValue {
    /// Classify a JSON value. `null` counts as absent.
    pub fn classify(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Number(n) => Some(match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => PayloadValue::Int(i),
                (None, Some(f)) => PayloadValue::Float(f),
                (None, None) => PayloadValue::Invalid("number"),
            }),
            Value::Bool(_) => Some(PayloadValue::Invalid("boolean")),
            Value::String(_) => Some(PayloadValue::Invalid("string")),
            Value::Array(_) => Some(PayloadValue::Invalid("array")),
            Value::Object(_) => Some(PayloadValue::Invalid("object")),
        }
    }
}

/// Coerced value ready for one of the typed tables
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TypedValue {
    Int(i64),
    Float(f64),
}

impl TypedValue {
    pub fn kind(&self) -> ChannelKind {
        match self {
            TypedValue::Int(_) => ChannelKind::Int,
            TypedValue::Float(_) => ChannelKind::Float,
        }
    }
}

impl fmt::Display for TypedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypedValue::Int(v) => write!(f, "{}", v),
            TypedValue::Float(v) => write!(f, "{}", v),
        }
    }
}

/// Row destined for `lake_raw_data_int` or `lake_raw_data_float`.
///
/// `recorded_at` is assigned by the database at insertion time; messages
/// carry no event time of their own.
#[derive(Debug, Clone, PartialEq)]
pub struct TypedRecord {
    pub channel: String,
    pub raw_payload: Value,
    pub value: TypedValue,
}

/// Monitoring source, e.g. an air quality station
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub location: Option<String>,
    pub metadata: Option<sqlx::types::Json<Value>>,
}

/// Measured parameter
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Metric {
    pub id: i64,
    pub display_name: String,
    pub units: Option<String>,
}

/// One observation of a metric at an entity.
///
/// `(entity_id, metric_id, timestamp_utc)` is unique in `fact_measurements`.
#[derive(Debug, Clone, PartialEq)]
pub struct Measurement {
    pub entity_id: i64,
    pub metric_id: i64,
    pub value: f64,
    pub timestamp_utc: DateTime<Utc>,
}
