//! Runtime values produced while evaluating query expressions.
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map as JsonMap, Number as JsonNumber, Value as JsonValue};

/// A query value.
///
/// `Empty` marks a row slot without a value (e.g. the output of a write with
/// no `RETURN`); it never reaches result sets. Strings are shared so that
/// document attributes and arena strings clone cheaply.
#[derive(Clone, Debug, Default)]
pub enum Value {
    /// No value at all.
    #[default]
    Empty,
    /// `null`.
    Null,
    /// Boolean.
    Bool(bool),
    /// All numbers are doubles.
    Number(f64),
    /// UTF-8 string.
    String(Arc<str>),
    /// Ordered list.
    Array(Vec<Value>),
    /// Object with attributes sorted by name.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Builds a string value.
    pub fn string(text: impl Into<Arc<str>>) -> Self {
        Value::String(text.into())
    }

    /// Converts a JSON value.
    pub fn from_json(json: &JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => n.as_f64().map_or(Value::Null, Value::Number),
            JsonValue::String(s) => Value::String(Arc::from(s.as_str())),
            JsonValue::Array(items) => Value::Array(items.iter().map(Value::from_json).collect()),
            JsonValue::Object(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Converts to JSON. Integral numbers become JSON integers, non-finite
    /// numbers become `null`, and `Empty` becomes `null`.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Value::Empty | Value::Null => JsonValue::Null,
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => JsonValue::String(s.to_string()),
            Value::Array(items) => JsonValue::Array(items.iter().map(Value::to_json).collect()),
            Value::Object(map) => {
                let mut out = JsonMap::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), v.to_json());
                }
                JsonValue::Object(out)
            }
        }
    }

    /// Whether this is the `Empty` marker.
    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    /// Whether this is `null` (or `Empty`).
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null | Value::Empty)
    }

    /// Truthiness: null, false, 0, "" are false; arrays and objects are true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Empty | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }

    /// Name of the value's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    fn type_rank(&self) -> u8 {
        match self {
            Value::Empty | Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    /// Numeric view, if this is a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// String view, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Lenient numeric conversion used by `TO_NUMBER`.
    pub fn to_number(&self) -> f64 {
        match self {
            Value::Empty | Value::Null => 0.0,
            Value::Bool(b) => f64::from(u8::from(*b)),
            Value::Number(n) => *n,
            Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
            Value::Array(items) => match items.as_slice() {
                [] => 0.0,
                [single] => single.to_number(),
                _ => 0.0,
            },
            Value::Object(_) => 0.0,
        }
    }

    /// Attribute lookup; anything missing is `null`.
    pub fn attribute(&self, name: &str) -> Value {
        match self {
            Value::Object(map) => map.get(name).cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Positional lookup for arrays (negative counts from the end) and named
    /// lookup for objects when the index is a string.
    pub fn index(&self, index: &Value) -> Value {
        match (self, index) {
            (Value::Array(items), Value::Number(n)) if n.fract() == 0.0 => {
                let len = items.len() as i64;
                let mut pos = *n as i64;
                if pos < 0 {
                    pos += len;
                }
                if (0..len).contains(&pos) {
                    items[pos as usize].clone()
                } else {
                    Value::Null
                }
            }
            (Value::Object(_), Value::String(name)) => self.attribute(name),
            _ => Value::Null,
        }
    }

    /// Total order: null < bool < number < string < array < object.
    pub fn compare(&self, other: &Value) -> Ordering {
        let (a, b) = (self.type_rank(), other.type_rank());
        if a != b {
            return a.cmp(&b);
        }
        match (self, other) {
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            (Value::Number(x), Value::Number(y)) => x.partial_cmp(y).unwrap_or(Ordering::Equal),
            (Value::String(x), Value::String(y)) => x.cmp(y),
            (Value::Array(x), Value::Array(y)) => {
                for (l, r) in x.iter().zip(y.iter()) {
                    let ord = l.compare(r);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                x.len().cmp(&y.len())
            }
            (Value::Object(x), Value::Object(y)) => {
                for ((lk, lv), (rk, rv)) in x.iter().zip(y.iter()) {
                    let ord = lk.cmp(rk).then_with(|| lv.compare(rv));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                x.len().cmp(&y.len())
            }
            _ => Ordering::Equal,
        }
    }

    /// Rendering used by `TO_STRING` and string concatenation.
    pub fn to_display_string(&self) -> String {
        match self {
            Value::Empty | Value::Null => String::new(),
            Value::String(s) => s.to_string(),
            other => other.to_json().to_string(),
        }
    }
}

fn number_to_json(n: f64) -> JsonValue {
    if !n.is_finite() {
        return JsonValue::Null;
    }
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        return JsonValue::Number(JsonNumber::from(n as i64));
    }
    JsonNumber::from_f64(n).map_or(JsonValue::Null, JsonValue::Number)
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.compare(other) == Ordering::Equal
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Number(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value as f64)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(Arc::from(value))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = JsonValue::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_conversion_keeps_integers_integral() {
        let v = Value::from_json(&json!({"a": [1, 2.5, "x", null, true]}));
        assert_eq!(v.to_json(), json!({"a": [1, 2.5, "x", null, true]}));
        assert_eq!(Value::Number(f64::NAN).to_json(), JsonValue::Null);
        assert_eq!(Value::Empty.to_json(), JsonValue::Null);
    }

    #[test]
    fn ordering_follows_type_ranks() {
        let ordered = [
            Value::Null,
            Value::Bool(false),
            Value::Bool(true),
            Value::Number(-1.0),
            Value::Number(3.0),
            Value::from("a"),
            Value::from("b"),
            Value::Array(vec![]),
            Value::Array(vec![Value::Number(1.0)]),
            Value::Object(BTreeMap::new()),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(pair[0].compare(&pair[1]), Ordering::Less, "{pair:?}");
        }
    }

    #[test]
    fn truthiness_and_lookup() {
        assert!(!Value::from("").is_truthy());
        assert!(Value::Array(vec![]).is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        let doc = Value::from_json(&json!({"a": {"b": [10, 20, 30]}}));
        let list = doc.attribute("a").attribute("b");
        assert_eq!(list.index(&Value::Number(-1.0)), Value::Number(30.0));
        assert_eq!(list.index(&Value::Number(9.0)), Value::Null);
        assert_eq!(doc.attribute("missing"), Value::Null);
        assert_eq!(Value::from(" 12 ").to_number(), 12.0);
    }
}
