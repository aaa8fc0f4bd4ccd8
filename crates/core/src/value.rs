//! Value wire encoding.
//!
//! Every stored value is persisted as text plus a small type tag. Numbers and
//! booleans are serialized to text on write and reconstructed on read; the two
//! absence markers (`undefined`, `null`) are written as empty text but keep
//! their own tag so they are never confused with an empty string on read.

use serde::{Deserialize, Serialize};

/// Wire type tag stored next to every value (`value_type` column).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i16)]
pub enum ValueType {
    Number = 0,
    Boolean = 1,
    String = 2,
    Undefined = 3,
    Null = 4,
}

impl ValueType {
    /// Small-integer code persisted in storage.
    pub fn code(self) -> i16 {
        self as i16
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            0 => Some(Self::Number),
            1 => Some(Self::Boolean),
            2 => Some(Self::String),
            3 => Some(Self::Undefined),
            4 => Some(Self::Null),
            _ => None,
        }
    }
}

/// A scalar value carried by a node field.
///
/// Relationship references are carried as [`NodeValue::Text`] with the
/// mutation's `is_relationship` flag set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum NodeValue {
    Number(f64),
    Boolean(bool),
    #[serde(rename = "string")]
    Text(String),
    Undefined,
    Null,
}

impl NodeValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            NodeValue::Number(_) => ValueType::Number,
            NodeValue::Boolean(_) => ValueType::Boolean,
            NodeValue::Text(_) => ValueType::String,
            NodeValue::Undefined => ValueType::Undefined,
            NodeValue::Null => ValueType::Null,
        }
    }

    /// True for the two absence markers.
    pub fn is_absent(&self) -> bool {
        matches!(self, NodeValue::Undefined | NodeValue::Null)
    }

    /// Text persisted in the `value` column.
    pub fn encode(&self) -> String {
        match self {
            NodeValue::Number(n) => encode_number(*n),
            NodeValue::Boolean(b) => b.to_string(),
            NodeValue::Text(s) => s.clone(),
            NodeValue::Undefined | NodeValue::Null => String::new(),
        }
    }

    /// Rebuild a value from its stored text and type code.
    ///
    /// The type tag wins over the stored text for absence markers. A missing
    /// text column for any other tag reads back as an empty string, and an
    /// unknown tag is treated as a plain string.
    pub fn decode(raw: Option<&str>, type_code: i16) -> NodeValue {
        let value_type = ValueType::from_code(type_code).unwrap_or(ValueType::String);
        match (value_type, raw) {
            (ValueType::Undefined, _) => NodeValue::Undefined,
            (ValueType::Null, _) => NodeValue::Null,
            (_, None) => NodeValue::Text(String::new()),
            (ValueType::Number, Some(raw)) => NodeValue::Number(decode_number(raw)),
            (ValueType::Boolean, Some(raw)) => NodeValue::Boolean(raw == "true"),
            (ValueType::String, Some(raw)) => NodeValue::Text(raw.to_string()),
        }
    }
}

fn encode_number(n: f64) -> String {
    if n.is_infinite() {
        if n.is_sign_positive() {
            "Infinity".to_string()
        } else {
            "-Infinity".to_string()
        }
    } else {
        n.to_string()
    }
}

fn decode_number(raw: &str) -> f64 {
    let trimmed = raw.trim();
    match trimmed {
        "" => 0.0,
        "Infinity" | "+Infinity" => f64::INFINITY,
        "-Infinity" => f64::NEG_INFINITY,
        _ => trimmed.parse::<f64>().unwrap_or(f64::NAN),
    }
}

impl From<f64> for NodeValue {
    fn from(value: f64) -> Self {
        NodeValue::Number(value)
    }
}

impl From<i64> for NodeValue {
    fn from(value: i64) -> Self {
        NodeValue::Number(value as f64)
    }
}

impl From<i32> for NodeValue {
    fn from(value: i32) -> Self {
        NodeValue::Number(f64::from(value))
    }
}

impl From<bool> for NodeValue {
    fn from(value: bool) -> Self {
        NodeValue::Boolean(value)
    }
}

impl From<&str> for NodeValue {
    fn from(value: &str) -> Self {
        NodeValue::Text(value.to_string())
    }
}

impl From<String> for NodeValue {
    fn from(value: String) -> Self {
        NodeValue::Text(value)
    }
}

impl<T: Into<NodeValue>> From<Option<T>> for NodeValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(NodeValue::Null)
    }
}

impl From<serde_json::Value> for NodeValue {
    /// JSON has no `undefined`; nested arrays/objects are stored as their JSON text.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => NodeValue::Null,
            serde_json::Value::Bool(b) => NodeValue::Boolean(b),
            serde_json::Value::Number(n) => NodeValue::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => NodeValue::Text(s),
            other => NodeValue::Text(other.to_string()),
        }
    }
}
