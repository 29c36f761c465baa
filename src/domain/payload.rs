//! Payload value
//!
//! Structured, JSON-compatible value carried by outbox records and bus messages.
//! Keeps the open-ended shape of event payloads while staying an explicit Rust type.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Scalar leaf of a payload tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

/// Tagged payload value: a scalar, an ordered array, or a string-keyed object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Payload {
    Scalar(Scalar),
    Array(Vec<Payload>),
    Object(BTreeMap<String, Payload>),
}

impl Payload {
    /// Empty object payload
    pub fn object() -> Self {
        Payload::Object(BTreeMap::new())
    }

    /// Builder-style insert; turns a non-object payload into an object first.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Payload>) -> Self {
        if !matches!(self, Payload::Object(_)) {
            self = Payload::object();
        }
        if let Payload::Object(map) = &mut self {
            map.insert(key.into(), value.into());
        }
        self
    }

    /// Look up a field of an object payload
    pub fn get(&self, key: &str) -> Option<&Payload> {
        match self {
            Payload::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Text value, if this is a text scalar
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Payload::Scalar(Scalar::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Payload::Scalar(Scalar::Null))
    }
}

impl Default for Payload {
    fn default() -> Self {
        Payload::object()
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Payload::Scalar(Scalar::Null),
            Value::Bool(b) => Payload::Scalar(Scalar::Bool(b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Payload::Scalar(Scalar::Int(i)),
                None => Payload::Scalar(Scalar::Float(n.as_f64().unwrap_or(f64::NAN))),
            },
            Value::String(s) => Payload::Scalar(Scalar::Text(s)),
            Value::Array(items) => Payload::Array(items.into_iter().map(Payload::from).collect()),
            Value::Object(map) => Payload::Object(
                map.into_iter()
                    .map(|(k, v)| (k, Payload::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<Payload> for serde_json::Value {
    fn from(payload: Payload) -> Self {
        use serde_json::Value;
        match payload {
            Payload::Scalar(Scalar::Null) => Value::Null,
            Payload::Scalar(Scalar::Bool(b)) => Value::Bool(b),
            Payload::Scalar(Scalar::Int(i)) => Value::from(i),
            // Non-finite floats have no JSON form
            Payload::Scalar(Scalar::Float(f)) => serde_json::Number::from_f64(f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Payload::Scalar(Scalar::Text(s)) => Value::String(s),
            Payload::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            Payload::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<&str> for Payload {
    fn from(s: &str) -> Self {
        Payload::Scalar(Scalar::Text(s.to_string()))
    }
}

impl From<String> for Payload {
    fn from(s: String) -> Self {
        Payload::Scalar(Scalar::Text(s))
    }
}

impl From<bool> for Payload {
    fn from(b: bool) -> Self {
        Payload::Scalar(Scalar::Bool(b))
    }
}

impl From<i64> for Payload {
    fn from(i: i64) -> Self {
        Payload::Scalar(Scalar::Int(i))
    }
}

impl From<uuid::Uuid> for Payload {
    fn from(id: uuid::Uuid) -> Self {
        Payload::Scalar(Scalar::Text(id.to_string()))
    }
}

impl<T: Into<Payload>> From<Option<T>> for Payload {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Payload::Scalar(Scalar::Null))
    }
}

impl<T: Into<Payload>> From<Vec<T>> for Payload {
    fn from(items: Vec<T>) -> Self {
        Payload::Array(items.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_json_shape_is_plain() {
        let payload = Payload::object()
            .with("role_code", "viewer")
            .with("grants", vec!["treasury.payments.view"])
            .with("expires_at", Option::<String>::None);

        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(
            value,
            json!({
                "role_code": "viewer",
                "grants": ["treasury.payments.view"],
                "expires_at": null
            })
        );
    }

    #[test]
    fn test_payload_from_nested_json() {
        let payload: Payload =
            serde_json::from_str(r#"{"a": {"b": [1, 2.5, true]}, "c": "x"}"#).unwrap();

        let inner = payload.get("a").and_then(|a| a.get("b")).unwrap();
        assert_eq!(
            inner,
            &Payload::Array(vec![
                Payload::Scalar(Scalar::Int(1)),
                Payload::Scalar(Scalar::Float(2.5)),
                Payload::Scalar(Scalar::Bool(true)),
            ])
        );
        assert_eq!(payload.get("c").and_then(Payload::as_str), Some("x"));
    }

    #[test]
    fn test_with_on_scalar_resets_to_object() {
        let payload = Payload::from("scalar").with("k", 1i64);
        assert_eq!(payload.get("k"), Some(&Payload::Scalar(Scalar::Int(1))));
    }
}
