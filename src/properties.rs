// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Properties
//!
//! `PublishOptions` carries the caller supplied metadata of an outgoing message.
//! Recognized fields are validated and defaulted when the message is published;
//! anything else travels untouched as an AMQP header. `MessageProperties` is the
//! decoded view of the same metadata handed to listeners.

use crate::errors::AmqpError;
use lapin::{
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
};
use serde_json::{Map, Number, Value};
use std::{
    collections::BTreeMap,
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

/// Lowest accepted message priority
pub const MIN_PRIORITY: i64 = 1;
/// Highest accepted message priority
pub const MAX_PRIORITY: i64 = 10;
/// Priority of messages published without one
pub const DEFAULT_PRIORITY: u8 = 1;

const KEY_PRIORITY: &str = "priority";
const KEY_MESSAGE_ID: &str = "messageId";
const KEY_TIMESTAMP: &str = "timestamp";
const KEY_TYPE: &str = "type";

/// Names the JSON kind of `value`, used in validation messages.
pub(crate) fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Caller supplied metadata for an outgoing message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishOptions {
    pub(crate) priority: Option<i64>,
    pub(crate) message_id: Option<String>,
    pub(crate) timestamp: Option<i64>,
    pub(crate) kind: Option<String>,
    pub(crate) headers: BTreeMap<String, Value>,
}

impl PublishOptions {
    /// Options with every property defaulted at publish time.
    pub fn new() -> PublishOptions {
        PublishOptions::default()
    }

    /// Sets the priority, which must lie in `1..=10`.
    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Sets the message id instead of a fresh UUID.
    ///
    /// # Parameters
    /// * `id` - Any string identifying the message
    pub fn message_id(mut self, id: &str) -> Self {
        self.message_id = Some(id.to_owned());
        self
    }

    /// Sets the timestamp in milliseconds since the Unix epoch.
    pub fn timestamp(mut self, millis: i64) -> Self {
        self.timestamp = Some(millis);
        self
    }

    /// Sets the message type.
    pub fn kind(mut self, kind: &str) -> Self {
        self.kind = Some(kind.to_owned());
        self
    }

    /// Adds a pass-through header.
    pub fn header(mut self, key: &str, value: Value) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Builds options from a loosely typed JSON mapping.
    ///
    /// The value must be an object. `priority`, `messageId`, `timestamp` and
    /// `type` are type checked here; range checks happen when the message is
    /// published. All other keys become headers.
    pub fn from_value(value: &Value) -> Result<PublishOptions, AmqpError> {
        let Value::Object(map) = value else {
            return Err(AmqpError::Validation(format!(
                "props must be a plain object, received {}",
                value_kind(value)
            )));
        };

        let mut options = PublishOptions::default();
        for (key, field) in map {
            match key.as_str() {
                KEY_PRIORITY => options.priority = Some(integer_field(KEY_PRIORITY, field)?),
                KEY_TIMESTAMP => options.timestamp = Some(integer_field(KEY_TIMESTAMP, field)?),
                KEY_MESSAGE_ID => options.message_id = Some(string_field(KEY_MESSAGE_ID, field)?),
                KEY_TYPE => options.kind = Some(string_field(KEY_TYPE, field)?),
                _ => {
                    options.headers.insert(key.clone(), field.clone());
                }
            }
        }

        Ok(options)
    }

    /// Validates the options and fills in defaults.
    pub(crate) fn resolve(&self) -> Result<EnvelopeProperties, AmqpError> {
        let priority = match self.priority {
            None => DEFAULT_PRIORITY,
            Some(p) if (MIN_PRIORITY..=MAX_PRIORITY).contains(&p) => p as u8,
            Some(p) => {
                return Err(AmqpError::Validation(format!(
                    "priority must be an integer between {MIN_PRIORITY} and {MAX_PRIORITY}, received {p}"
                )))
            }
        };

        let timestamp = match self.timestamp {
            None => now_millis(),
            Some(t) if t >= 0 => t as u64,
            Some(t) => {
                return Err(AmqpError::Validation(format!(
                    "timestamp must be a non-negative integer, received {t}"
                )))
            }
        };

        Ok(EnvelopeProperties {
            message_id: self
                .message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            priority,
            timestamp,
            kind: self.kind.clone(),
            headers: self.headers.clone(),
        })
    }
}

fn integer_field(key: &str, value: &Value) -> Result<i64, AmqpError> {
    value.as_i64().ok_or_else(|| {
        AmqpError::Validation(format!(
            "{key} must be an integer, received {}",
            match value {
                Value::Number(_) => "non-integer number",
                other => value_kind(other),
            }
        ))
    })
}

fn string_field(key: &str, value: &Value) -> Result<String, AmqpError> {
    value.as_str().map(str::to_owned).ok_or_else(|| {
        AmqpError::Validation(format!(
            "{key} must be a string, received {}",
            value_kind(value)
        ))
    })
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Fully resolved metadata of an envelope about to be published.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct EnvelopeProperties {
    pub(crate) message_id: String,
    pub(crate) priority: u8,
    pub(crate) timestamp: u64,
    pub(crate) kind: Option<String>,
    pub(crate) headers: BTreeMap<String, Value>,
}

impl EnvelopeProperties {
    /// Renders the envelope metadata as AMQP properties. `extra` holds headers
    /// added by the bus itself, such as trace context.
    pub(crate) fn into_amqp(
        self,
        content_type: &str,
        mut extra: BTreeMap<ShortString, AMQPValue>,
    ) -> BasicProperties {
        for (key, value) in self.headers {
            extra.insert(ShortString::from(key), json_to_amqp(value));
        }

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(content_type))
            .with_message_id(ShortString::from(self.message_id))
            .with_priority(self.priority)
            .with_timestamp(self.timestamp)
            .with_headers(FieldTable::from(extra));

        if let Some(kind) = self.kind {
            props = props.with_type(ShortString::from(kind));
        }

        props
    }
}

/// Metadata of a delivered message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub priority: Option<u8>,
    /// Milliseconds since the Unix epoch
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, Value>,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
}

impl MessageProperties {
    pub(crate) fn from_amqp(
        props: &BasicProperties,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
    ) -> MessageProperties {
        let headers = props
            .headers()
            .as_ref()
            .map(|table| {
                table
                    .inner()
                    .iter()
                    .map(|(k, v)| (k.to_string(), amqp_to_json(v)))
                    .collect()
            })
            .unwrap_or_default();

        MessageProperties {
            message_id: props.message_id().as_ref().map(|v| v.to_string()),
            priority: *props.priority(),
            timestamp: *props.timestamp(),
            kind: props.kind().as_ref().map(|v| v.to_string()),
            content_type: props.content_type().as_ref().map(|v| v.to_string()),
            headers,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
        }
    }
}

/// Converts a JSON header value to its closest AMQP field type. Composite
/// values are carried as their JSON text.
fn json_to_amqp(value: Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(v),
        Value::Number(n) => match (n.as_i64(), n.as_f64()) {
            (Some(i), _) => AMQPValue::LongLongInt(i),
            (None, Some(f)) => AMQPValue::Double(f),
            _ => AMQPValue::LongString(LongString::from(n.to_string())),
        },
        Value::String(s) => AMQPValue::LongString(LongString::from(s)),
        other => AMQPValue::LongString(LongString::from(other.to_string())),
    }
}

fn amqp_to_json(value: &AMQPValue) -> Value {
    match value {
        AMQPValue::Void => Value::Null,
        AMQPValue::Boolean(v) => Value::Bool(*v),
        AMQPValue::ShortShortInt(v) => Value::from(*v),
        AMQPValue::ShortShortUInt(v) => Value::from(*v),
        AMQPValue::ShortInt(v) => Value::from(*v),
        AMQPValue::ShortUInt(v) => Value::from(*v),
        AMQPValue::LongInt(v) => Value::from(*v),
        AMQPValue::LongUInt(v) => Value::from(*v),
        AMQPValue::LongLongInt(v) => Value::from(*v),
        AMQPValue::Timestamp(v) => Value::from(*v),
        AMQPValue::Float(v) => Number::from_f64(f64::from(*v))
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AMQPValue::Double(v) => Number::from_f64(*v)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        AMQPValue::ShortString(v) => Value::String(v.to_string()),
        AMQPValue::LongString(v) => {
            Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned())
        }
        AMQPValue::FieldArray(arr) => {
            Value::Array(arr.as_slice().iter().map(amqp_to_json).collect())
        }
        AMQPValue::FieldTable(table) => Value::Object(
            table
                .inner()
                .iter()
                .map(|(k, v)| (k.to_string(), amqp_to_json(v)))
                .collect::<Map<String, Value>>(),
        ),
        other => Value::String(format!("{other:?}")),
    }
}
