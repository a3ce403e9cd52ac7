//! Payload validation and routing to the typed tables

use std::collections::HashMap;

use serde_json::Value;

use crate::{
    config::RouterConfig,
    errors::{LakeError, ValidationError},
    models::{ChannelKind, PayloadValue, TypedRecord, TypedValue},
};

/// Name of the required payload field
pub const VALUE_FIELD: &str = "value";

/// Where an inbound message goes
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Write to the table matching the record's value kind
    Typed(TypedRecord),
    /// Channel has no declared kind; not an error
    Unrouted { channel: String, payload: Value },
}

/// Maps channels to the value kind they must carry
#[derive(Debug, Clone)]
pub struct Router {
    channels: HashMap<String, ChannelKind>,
    infer_from_suffix: bool,
}

impl Router {
    pub fn new(config: &RouterConfig) -> Self {
        let channels = config
            .channels
            .iter()
            .map(|c| (c.topic.clone(), c.kind))
            .collect();

        Self {
            channels,
            infer_from_suffix: config.infer_from_suffix,
        }
    }

    /// Declared kind of a channel, if any
    pub fn kind_of(&self, channel: &str) -> Option<ChannelKind> {
        self.channels.get(channel).copied().or_else(|| {
            if self.infer_from_suffix {
                ChannelKind::from_topic_suffix(channel)
            } else {
                None
            }
        })
    }

    /// Decode a raw message body into a JSON object
    pub fn decode(payload: &[u8]) -> Result<Value, LakeError> {
        let value: Value = serde_json::from_slice(payload)?;
        if !value.is_object() {
            return Err(LakeError::DecodeError(format!(
                "expected a JSON object, got {}",
                json_type(&value)
            )));
        }
        Ok(value)
    }

    /// Decide where a decoded payload belongs and coerce its value
    pub fn route(&self, channel: &str, payload: Value) -> Result<Route, ValidationError> {
        let Some(kind) = self.kind_of(channel) else {
            return Ok(Route::Unrouted {
                channel: channel.to_string(),
                payload,
            });
        };

        let classified = payload
            .get(VALUE_FIELD)
            .and_then(PayloadValue::classify)
            .ok_or(ValidationError::MissingField { field: VALUE_FIELD })?;

        let value = coerce(kind, classified)?;

        Ok(Route::Typed(TypedRecord {
            channel: channel.to_string(),
            raw_payload: payload,
            value,
        }))
    }
}

/// Coerce a classified value to the channel's kind.
///
/// Whole-number floats are accepted on int channels; any integer is
/// widened on float channels.
fn coerce(kind: ChannelKind, value: PayloadValue) -> Result<TypedValue, ValidationError> {
    let mismatch = |found: &str| ValidationError::TypeMismatch {
        expected: kind,
        found: found.to_string(),
    };

    match (kind, value) {
        (ChannelKind::Int, PayloadValue::Int(i)) => Ok(TypedValue::Int(i)),
        (ChannelKind::Int, PayloadValue::Float(f)) => {
            if !f.is_finite() || f.fract() != 0.0 {
                Err(mismatch(&format!("fractional number {}", f)))
            } else if f < i64::MIN as f64 || f >= i64::MAX as f64 {
                Err(mismatch(&format!("out of range number {}", f)))
            } else {
                Ok(TypedValue::Int(f as i64))
            }
        }
        (ChannelKind::Float, PayloadValue::Int(i)) => Ok(TypedValue::Float(i as f64)),
        (ChannelKind::Float, PayloadValue::Float(f)) => Ok(TypedValue::Float(f)),
        (_, PayloadValue::Invalid(found)) => Err(mismatch(found)),
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
