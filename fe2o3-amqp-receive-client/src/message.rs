//! Messages handed to the consumer

use std::collections::BTreeMap;

use fe2o3_amqp_types::{
    messaging::{annotations::OwnedKey, AmqpValue, Body, Message},
    primitives::Value,
};

use crate::{
    constants::{DEFAULT_MESSAGE_FORMAT, ENQUEUED_TIME, OFFSET, PARTITION_KEY, SEQUENCE_NUMBER},
    error::MalformedMessageError,
};

/// Body of a received message
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    /// One or more opaque data sections
    Data(Vec<Vec<u8>>),

    /// A single AMQP value
    Value(Value),

    /// The elements of one or more sequence sections
    Sequence(Vec<Value>),

    /// No body section
    Empty,
}

impl From<Body<Value>> for MessageBody {
    fn from(body: Body<Value>) -> Self {
        match body {
            Body::Data(batch) => {
                MessageBody::Data(batch.into_iter().map(|data| data.0.into_vec()).collect())
            }
            Body::Sequence(batch) => {
                MessageBody::Sequence(batch.into_iter().flat_map(|seq| seq.0).collect())
            }
            Body::Value(AmqpValue(value)) => MessageBody::Value(value),
            Body::Empty => MessageBody::Empty,
        }
    }
}

/// Value of a broker-set annotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AnnotationValue {
    /// Null
    Null,

    /// Boolean
    Bool(bool),

    /// Signed integer of any width
    Long(i64),

    /// Unsigned integer of any width
    ULong(u64),

    /// Milliseconds since the unix epoch
    Timestamp(i64),

    /// String or symbol
    String(String),

    /// Binary
    Binary(Vec<u8>),
}

impl AnnotationValue {
    /// Convert an AMQP value. Returns `None` for compound and floating point values
    pub fn from_value(value: Value) -> Option<Self> {
        let value = match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Ubyte(v) => Self::ULong(v.into()),
            Value::Ushort(v) => Self::ULong(v.into()),
            Value::Uint(v) => Self::ULong(v.into()),
            Value::Ulong(v) => Self::ULong(v),
            Value::Byte(v) => Self::Long(v.into()),
            Value::Short(v) => Self::Long(v.into()),
            Value::Int(v) => Self::Long(v.into()),
            Value::Long(v) => Self::Long(v),
            Value::Timestamp(ts) => Self::Timestamp(ts.milliseconds()),
            Value::Char(c) => Self::String(c.to_string()),
            Value::String(s) => Self::String(s),
            Value::Symbol(s) => Self::String(s.0),
            Value::Binary(buf) => Self::Binary(buf.into_vec()),
            _ => return None,
        };
        Some(value)
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Long(v) | Self::Timestamp(v) => Some(*v),
            Self::ULong(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }
}

/// A message delivered on the receive link
///
/// Immutable once handed to the consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    body: MessageBody,
    annotations: BTreeMap<String, AnnotationValue>,
    message_format: u32,
}

impl ReceivedMessage {
    /// Creates a message with no annotations
    pub fn new(body: MessageBody) -> Self {
        Self {
            body,
            annotations: BTreeMap::new(),
            message_format: DEFAULT_MESSAGE_FORMAT,
        }
    }

    /// Creates a message from its parts, checking that the well-known annotations have the
    /// types the broker is known to send
    pub fn from_parts(
        body: MessageBody,
        annotations: BTreeMap<String, AnnotationValue>,
        message_format: u32,
    ) -> Result<Self, MalformedMessageError> {
        check_annotations(&annotations)?;
        Ok(Self {
            body,
            annotations,
            message_format,
        })
    }

    /// Body of the message
    pub fn body(&self) -> &MessageBody {
        &self.body
    }

    /// Consume the message into its body
    pub fn into_body(self) -> MessageBody {
        self.body
    }

    /// The data sections of the body. Empty if the body is not made of data sections
    pub fn data(&self) -> impl Iterator<Item = &[u8]> {
        let sections: &[Vec<u8>] = match &self.body {
            MessageBody::Data(sections) => sections,
            _ => &[],
        };
        sections.iter().map(|section| &section[..])
    }

    /// Broker-set message annotations
    pub fn annotations(&self) -> &BTreeMap<String, AnnotationValue> {
        &self.annotations
    }

    /// Look up a single annotation
    pub fn annotation(&self, key: &str) -> Option<&AnnotationValue> {
        self.annotations.get(key)
    }

    /// Message format number
    pub fn message_format(&self) -> u32 {
        self.message_format
    }

    /// `x-opt-partition-key`
    pub fn partition_key(&self) -> Option<&str> {
        match self.annotations.get(PARTITION_KEY) {
            Some(AnnotationValue::String(key)) => Some(key),
            _ => None,
        }
    }

    /// `x-opt-sequence-number`
    pub fn sequence_number(&self) -> Option<i64> {
        self.annotations
            .get(SEQUENCE_NUMBER)
            .and_then(AnnotationValue::as_i64)
    }

    /// `x-opt-offset`
    pub fn offset(&self) -> Option<String> {
        match self.annotations.get(OFFSET)? {
            AnnotationValue::String(offset) => Some(offset.clone()),
            other => other.as_i64().map(|offset| offset.to_string()),
        }
    }

    /// `x-opt-enqueued-time` in milliseconds since the unix epoch
    pub fn enqueued_time(&self) -> Option<i64> {
        self.annotations
            .get(ENQUEUED_TIME)
            .and_then(AnnotationValue::as_i64)
    }
}

impl ReceivedMessage {
    /// Convert a decoded message that arrived in a transfer of `message_format`
    pub fn from_message(
        message: Message<Body<Value>>,
        message_format: u32,
    ) -> Result<Self, MalformedMessageError> {
        let mut annotations = BTreeMap::new();
        if let Some(message_annotations) = message.message_annotations {
            for (key, value) in message_annotations.0.iter() {
                let key = match key {
                    OwnedKey::Symbol(symbol) => symbol.0.clone(),
                    OwnedKey::Ulong(code) => code.to_string(),
                };
                match AnnotationValue::from_value(value.clone()) {
                    Some(value) => {
                        annotations.insert(key, value);
                    }
                    None => tracing::trace!(%key, "skipping annotation of unsupported type"),
                }
            }
        }

        Self::from_parts(message.body.into(), annotations, message_format)
    }
}

impl TryFrom<Message<Body<Value>>> for ReceivedMessage {
    type Error = MalformedMessageError;

    fn try_from(message: Message<Body<Value>>) -> Result<Self, Self::Error> {
        Self::from_message(message, DEFAULT_MESSAGE_FORMAT)
    }
}

fn check_annotations(
    annotations: &BTreeMap<String, AnnotationValue>,
) -> Result<(), MalformedMessageError> {
    let invalid = |key: &str, expected| MalformedMessageError::InvalidAnnotation {
        key: key.to_string(),
        expected,
    };

    for (key, value) in annotations {
        let valid = match key.as_str() {
            PARTITION_KEY => matches!(value, AnnotationValue::String(_) | AnnotationValue::Null),
            SEQUENCE_NUMBER => value.as_i64().is_some(),
            OFFSET => matches!(value, AnnotationValue::String(_)) || value.as_i64().is_some(),
            ENQUEUED_TIME => value.as_i64().is_some(),
            _ => true,
        };
        if !valid {
            let expected = match key.as_str() {
                PARTITION_KEY => "a string",
                OFFSET => "a string or an integer",
                ENQUEUED_TIME => "a timestamp",
                _ => "an integer",
            };
            return Err(invalid(key, expected));
        }
    }
    Ok(())
}
