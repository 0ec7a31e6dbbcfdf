//! Decoded message types shared by both receivers
//!
//! - [`DecodedMessage`]: one frame after decoding, with its addressing
//! - [`MessagePayload`]: compiled record or runtime field map
//! - [`FieldValue`]: one value of a runtime field map
//! - [`JsonMessage`]: runtime field map rendered for JSON subscribers

use mavlink::common::MavMessage;
use serde_json::{Map, Number, Value};

/// Identity of the connection a message arrived on
pub type ConnectionId = u64;

/// Value of one field decoded with a runtime schema
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Non-finite float (NaN, +/-Inf)
    Null,
    Text(String),
    IntArray(Vec<i64>),
    UIntArray(Vec<u64>),
    /// `None` marks a non-finite element
    FloatArray(Vec<Option<f64>>),
}

impl FieldValue {
    /// Float value, with NaN and infinities mapped to [`FieldValue::Null`]
    pub fn from_float(value: f64) -> Self {
        if value.is_finite() {
            FieldValue::Float(value)
        } else {
            FieldValue::Null
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            FieldValue::Int(v) => Value::from(*v),
            FieldValue::UInt(v) => Value::from(*v),
            FieldValue::Float(v) => float_json(Some(*v)),
            FieldValue::Null => Value::Null,
            FieldValue::Text(s) => Value::String(s.clone()),
            FieldValue::IntArray(v) => Value::Array(v.iter().map(|x| Value::from(*x)).collect()),
            FieldValue::UIntArray(v) => Value::Array(v.iter().map(|x| Value::from(*x)).collect()),
            FieldValue::FloatArray(v) => Value::Array(v.iter().map(|x| float_json(*x)).collect()),
        }
    }

    /// Integer view of a scalar integer field
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::UInt(v) => Some(*v),
            FieldValue::Int(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }
}

fn float_json(value: Option<f64>) -> Value {
    value
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Message content, depending on which receiver produced it
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    /// Compiled message set
    Typed(Box<MavMessage>),
    /// Runtime schema, fields in declaration order
    Fields(Vec<(String, FieldValue)>),
}

/// One received message
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedMessage {
    /// Connection the frame arrived on (0 until stamped by the connection)
    pub connection_id: ConnectionId,
    pub message_id: u32,
    pub message_name: String,
    pub system_id: u8,
    pub component_id: u8,
    pub sequence: u8,
    /// 0 when the message has no target
    pub target_system_id: u8,
    /// 0 when the message has no target
    pub target_component_id: u8,
    pub payload: MessagePayload,
    /// Frame exactly as received, for forwarding
    pub raw_frame: Vec<u8>,
}

impl DecodedMessage {
    /// Compiled record, if this came from the fixed receiver
    pub fn typed(&self) -> Option<&MavMessage> {
        match &self.payload {
            MessagePayload::Typed(msg) => Some(msg),
            MessagePayload::Fields(_) => None,
        }
    }

    /// Field map, if this came from the dynamic receiver
    pub fn fields(&self) -> Option<&[(String, FieldValue)]> {
        match &self.payload {
            MessagePayload::Typed(_) => None,
            MessagePayload::Fields(fields) => Some(fields),
        }
    }

    /// Look up a field by name in the runtime field map
    pub fn field(&self, name: &str) -> Option<&FieldValue> {
        self.fields()?
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Field map as a JSON object string
    ///
    /// `{"message_id":…,"message_name":…,<fields…>}`; `None` for typed
    /// messages.
    pub fn to_json(&self) -> Option<String> {
        let fields = self.fields()?;
        let mut object = Map::new();
        object.insert("message_id".to_string(), Value::from(self.message_id));
        object.insert(
            "message_name".to_string(),
            Value::String(self.message_name.clone()),
        );
        for (name, value) in fields {
            object.insert(name.clone(), value.to_json());
        }
        Some(Value::Object(object).to_string())
    }
}

/// Message decoded with the runtime schema, as delivered to JSON subscribers
#[derive(Debug, Clone, PartialEq)]
pub struct JsonMessage {
    pub connection_id: ConnectionId,
    pub message_id: u32,
    pub message_name: String,
    pub system_id: u8,
    pub component_id: u8,
    pub target_system_id: u8,
    pub target_component_id: u8,
    /// See [`DecodedMessage::to_json`]
    pub fields_json: String,
}

impl DecodedMessage {
    /// JSON view of a runtime-schema message; `None` for typed messages
    pub fn to_json_message(&self) -> Option<JsonMessage> {
        Some(JsonMessage {
            connection_id: self.connection_id,
            message_id: self.message_id,
            message_name: self.message_name.clone(),
            system_id: self.system_id,
            component_id: self.component_id,
            target_system_id: self.target_system_id,
            target_component_id: self.target_component_id,
            fields_json: self.to_json()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dynamic(fields: Vec<(String, FieldValue)>) -> DecodedMessage {
        DecodedMessage {
            connection_id: 0,
            message_id: 30,
            message_name: "ATTITUDE".to_string(),
            system_id: 1,
            component_id: 1,
            sequence: 0,
            target_system_id: 0,
            target_component_id: 0,
            payload: MessagePayload::Fields(fields),
            raw_frame: Vec::new(),
        }
    }

    #[test]
    fn test_non_finite_floats_render_null() {
        assert_eq!(FieldValue::from_float(f64::NAN), FieldValue::Null);
        assert_eq!(FieldValue::from_float(f64::INFINITY), FieldValue::Null);
        assert_eq!(FieldValue::from_float(1.5), FieldValue::Float(1.5));

        let arr = FieldValue::FloatArray(vec![Some(1.0), None]);
        assert_eq!(arr.to_json().to_string(), "[1.0,null]");
    }

    #[test]
    fn test_json_keeps_declaration_order() {
        let msg = dynamic(vec![
            ("time_boot_ms".to_string(), FieldValue::UInt(1000)),
            ("roll".to_string(), FieldValue::Null),
            ("text".to_string(), FieldValue::Text("hi".to_string())),
            ("offsets".to_string(), FieldValue::IntArray(vec![-1, 2])),
        ]);

        let json = msg.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"message_id":30,"message_name":"ATTITUDE","time_boot_ms":1000,"roll":null,"text":"hi","offsets":[-1,2]}"#
        );

        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert!(parsed["roll"].is_null());
    }

    #[test]
    fn test_field_lookup() {
        let msg = dynamic(vec![("target_system".to_string(), FieldValue::UInt(7))]);
        assert_eq!(msg.field("target_system").and_then(FieldValue::as_u64), Some(7));
        assert!(msg.field("missing").is_none());
        assert!(msg.typed().is_none());
    }

    #[test]
    fn test_json_message_carries_addressing() {
        let mut msg = dynamic(vec![("roll".to_string(), FieldValue::Float(0.25))]);
        msg.connection_id = 4;
        msg.system_id = 9;

        let json = msg.to_json_message().unwrap();
        assert_eq!(json.connection_id, 4);
        assert_eq!(json.system_id, 9);
        assert_eq!(json.message_name, "ATTITUDE");
        assert_eq!(
            json.fields_json,
            r#"{"message_id":30,"message_name":"ATTITUDE","roll":0.25}"#
        );
    }
}
