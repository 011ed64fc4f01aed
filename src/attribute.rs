//! Typed field descriptors over a model's backing JSON document.
//!
//! A [`FieldSpec`] names one key in a model's document and says how to read
//! and write it ([`FieldKind`]). Decoding never fails: absent or
//! mistyped values collapse to the kind's default (`Null` for scalars, an
//! empty list for arrays, an empty map for objects, the Unix epoch for a
//! non-numeric epoch timestamp). Encoding coerces the caller's value to
//! the declared type and fails only when no sensible coercion exists.
//!
//! Lazy loading and dirty tracking are not handled here; see
//! [`crate::model::Model::field`] and [`crate::model::Model::set`].

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{Map, Value};

use crate::error::{ApiError, Result};

/// How a field is stored in the document and projected to the caller.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FieldKind {
    /// A JSON string; numbers and booleans are stringified on write.
    String,
    /// A JSON integer; numeric strings are parsed on write.
    Integer,
    /// A JSON number.
    Float,
    /// A JSON boolean; `"true"`/`"false"` strings are accepted on write.
    Boolean,
    /// Any JSON value, stored as given.
    Any,
    /// A JSON array. Absent reads as an empty list.
    Array,
    /// A JSON object. Absent reads as an empty map.
    Object,
    /// An ISO-8601 timestamp string.
    IsoDate,
    /// A numeric epoch timestamp; the stored number divided by `divisor`
    /// gives seconds (1000.0 for milliseconds).
    EpochDate {
        /// Units per second of the stored value.
        divisor: f64,
    },
    /// Base64-encoded bytes.
    Binary,
    /// A reference to another model, resolved through the sibling field
    /// `id_field` (or `<name>_id` when `None`).
    ForeignKey {
        /// Registered name of the referenced model type.
        model: &'static str,
        /// Sibling attribute holding the referenced identifier.
        id_field: Option<&'static str>,
    },
}

/// One declared field of a model schema.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    /// Document key.
    pub name: &'static str,
    /// Storage and projection type.
    pub kind: FieldKind,
    /// Whether `validate()` requires this key to be present.
    pub required: bool,
    /// Value seeded into freshly created objects.
    pub default: Option<fn() -> Value>,
}

impl FieldSpec {
    /// An optional field with no default.
    pub const fn new(name: &'static str, kind: FieldKind) -> Self {
        FieldSpec {
            name,
            kind,
            required: false,
            default: None,
        }
    }

    /// A field `validate()` requires.
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        FieldSpec {
            name,
            kind,
            required: true,
            default: None,
        }
    }

    /// Attaches a default for new objects.
    pub const fn with_default(mut self, default: fn() -> Value) -> Self {
        self.default = Some(default);
        self
    }

    /// For foreign keys, the document key carrying the referenced id.
    pub fn id_field(&self) -> Option<String> {
        match self.kind {
            FieldKind::ForeignKey { id_field, .. } => Some(
                id_field
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}_id", self.name)),
            ),
            _ => None,
        }
    }
}

/// A field value as seen by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    /// Absent or null scalar.
    Null,
    /// A scalar or untyped JSON value.
    Value(Value),
    /// Array fields.
    List(Vec<Value>),
    /// Object fields.
    Map(Map<String, Value>),
    /// ISO-8601 and epoch fields.
    Timestamp(DateTime<Utc>),
    /// Binary fields.
    Bytes(Vec<u8>),
}

impl FieldValue {
    /// Borrows the inner JSON value for `Value` variants.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldValue::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the inner string for string scalars.
    pub fn as_str(&self) -> Option<&str> {
        self.as_value().and_then(Value::as_str)
    }

    /// Returns the timestamp for date fields.
    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            FieldValue::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// `true` for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => FieldValue::Null,
            other => FieldValue::Value(other),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Value(Value::String(s.to_string()))
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Value(Value::String(s))
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Value(Value::from(n))
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Value(Value::Bool(b))
    }
}

impl From<Vec<Value>> for FieldValue {
    fn from(items: Vec<Value>) -> Self {
        FieldValue::List(items)
    }
}

impl From<Map<String, Value>> for FieldValue {
    fn from(m: Map<String, Value>) -> Self {
        FieldValue::Map(m)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(ts: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(ts)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(bytes: Vec<u8>) -> Self {
        FieldValue::Bytes(bytes)
    }
}

impl FieldKind {
    /// Projects a raw document value (or its absence) to the caller's type.
    pub fn decode(&self, raw: Option<&Value>) -> FieldValue {
        let raw = raw.filter(|v| !v.is_null());
        match self {
            FieldKind::Array => match raw {
                Some(Value::Array(items)) => FieldValue::List(items.clone()),
                Some(other) => FieldValue::List(vec![other.clone()]),
                None => FieldValue::List(Vec::new()),
            },
            FieldKind::Object => match raw {
                Some(Value::Object(m)) => FieldValue::Map(m.clone()),
                _ => FieldValue::Map(Map::new()),
            },
            FieldKind::IsoDate => raw
                .and_then(Value::as_str)
                .and_then(parse_iso8601)
                .map(FieldValue::Timestamp)
                .unwrap_or(FieldValue::Null),
            FieldKind::EpochDate { divisor } => match raw {
                None => FieldValue::Null,
                Some(v) => {
                    let secs = v.as_f64().map(|n| n / divisor).unwrap_or(0.0);
                    FieldValue::Timestamp(epoch_to_datetime(secs))
                }
            },
            FieldKind::Binary => match raw.and_then(Value::as_str) {
                Some(s) => BASE64
                    .decode(s)
                    .map(FieldValue::Bytes)
                    .unwrap_or(FieldValue::Null),
                None => FieldValue::Null,
            },
            FieldKind::String
            | FieldKind::Integer
            | FieldKind::Float
            | FieldKind::Boolean
            | FieldKind::Any
            | FieldKind::ForeignKey { .. } => match raw {
                Some(v) => FieldValue::Value(v.clone()),
                None => FieldValue::Null,
            },
        }
    }

    /// Coerces a caller value into the JSON stored in the document.
    pub fn encode(&self, name: &str, value: FieldValue) -> Result<Value> {
        let mismatch = |what: &str| {
            ApiError::InvalidArgument(format!("field {name:?} expects {what}"))
        };

        match (self, value) {
            (_, FieldValue::Null) => Ok(Value::Null),
            (FieldKind::Any, FieldValue::Value(v)) => Ok(v),
            (FieldKind::Any, FieldValue::List(items)) => Ok(Value::Array(items)),
            (FieldKind::Any, FieldValue::Map(m)) => Ok(Value::Object(m)),

            (FieldKind::String, FieldValue::Value(v)) => match v {
                Value::String(_) => Ok(v),
                Value::Number(n) => Ok(Value::String(n.to_string())),
                Value::Bool(b) => Ok(Value::String(b.to_string())),
                _ => Err(mismatch("a string")),
            },
            (FieldKind::Integer, FieldValue::Value(v)) => match &v {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(v.clone()),
                Value::Number(n) => n
                    .as_f64()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| Value::from(f as i64))
                    .ok_or_else(|| mismatch("an integer")),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(Value::from)
                    .map_err(|_| mismatch("an integer")),
                _ => Err(mismatch("an integer")),
            },
            (FieldKind::Float, FieldValue::Value(v)) => match &v {
                Value::Number(_) => Ok(v.clone()),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| mismatch("a number")),
                _ => Err(mismatch("a number")),
            },
            (FieldKind::Boolean, FieldValue::Value(v)) => match &v {
                Value::Bool(_) => Ok(v.clone()),
                Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
                Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
                _ => Err(mismatch("a boolean")),
            },

            (FieldKind::Array, FieldValue::List(items)) => Ok(Value::Array(items)),
            (FieldKind::Array, FieldValue::Value(Value::Array(items))) => Ok(Value::Array(items)),
            (FieldKind::Array, FieldValue::Value(single)) => Ok(Value::Array(vec![single])),

            (FieldKind::Object, FieldValue::Map(m)) => Ok(Value::Object(m)),
            (FieldKind::Object, FieldValue::Value(Value::Object(m))) => Ok(Value::Object(m)),

            (FieldKind::IsoDate, FieldValue::Timestamp(ts)) => Ok(Value::String(
                ts.to_rfc3339_opts(SecondsFormat::Millis, true),
            )),
            (FieldKind::IsoDate, FieldValue::Value(Value::String(s))) => parse_iso8601(&s)
                .map(|_| Value::String(s))
                .ok_or_else(|| mismatch("an ISO-8601 timestamp")),

            (FieldKind::EpochDate { divisor }, FieldValue::Timestamp(ts)) => {
                let secs = ts.timestamp() as f64 + f64::from(ts.timestamp_subsec_millis()) / 1000.0;
                let scaled = secs * divisor;
                if scaled.fract() == 0.0 {
                    Ok(Value::from(scaled as i64))
                } else {
                    serde_json::Number::from_f64(scaled)
                        .map(Value::Number)
                        .ok_or_else(|| mismatch("a finite timestamp"))
                }
            }
            (FieldKind::EpochDate { .. }, FieldValue::Value(v @ Value::Number(_))) => Ok(v),

            (FieldKind::Binary, FieldValue::Bytes(bytes)) => {
                Ok(Value::String(BASE64.encode(bytes)))
            }

            (FieldKind::ForeignKey { .. }, _) => Err(ApiError::InvalidArgument(format!(
                "field {name:?} is a reference; set its id field instead"
            ))),

            (kind, other) => Err(ApiError::InvalidArgument(format!(
                "field {name:?} of kind {kind:?} cannot hold {other:?}"
            ))),
        }
    }
}

/// Parses RFC 3339 / ISO-8601 strings, tolerating a missing offset (read as UTC).
pub fn parse_iso8601(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn epoch_to_datetime(secs: f64) -> DateTime<Utc> {
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round() as u32;
    Utc.timestamp_opt(whole as i64, nanos.min(999_999_999))
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn absent_array_reads_as_empty_list() {
        assert_eq!(FieldKind::Array.decode(None), FieldValue::List(vec![]));
        assert_eq!(
            FieldKind::Array.decode(Some(&Value::Null)),
            FieldValue::List(vec![])
        );
    }

    #[test]
    fn absent_object_reads_as_empty_map() {
        assert_eq!(FieldKind::Object.decode(None), FieldValue::Map(Map::new()));
    }

    #[test]
    fn absent_scalar_reads_as_null() {
        assert!(FieldKind::String.decode(None).is_null());
        assert!(FieldKind::IsoDate.decode(None).is_null());
    }

    #[test]
    fn iso_date_round_trips_through_document_string() {
        let raw = json!("2024-03-01T12:30:45.123Z");
        let ts = FieldKind::IsoDate.decode(Some(&raw)).as_timestamp().unwrap();
        assert_eq!(ts.timestamp(), 1_709_296_245);
        let stored = FieldKind::IsoDate
            .encode("t", FieldValue::Timestamp(ts))
            .unwrap();
        assert_eq!(stored, raw);
    }

    #[test]
    fn naive_iso_date_is_read_as_utc() {
        let ts = parse_iso8601("2024-03-01T00:00:00").unwrap();
        assert_eq!(ts.timestamp(), 1_709_251_200);
    }

    #[test]
    fn epoch_date_applies_divisor() {
        let kind = FieldKind::EpochDate { divisor: 1000.0 };
        let ts = kind.decode(Some(&json!(1_700_000_000_500_i64))).as_timestamp().unwrap();
        assert_eq!(ts.timestamp(), 1_700_000_000);
        assert_eq!(ts.timestamp_subsec_millis(), 500);
        assert_eq!(
            kind.encode("t", FieldValue::Timestamp(ts)).unwrap(),
            json!(1_700_000_000_500_i64)
        );
    }

    #[test]
    fn non_numeric_epoch_defaults_to_unix_epoch() {
        let kind = FieldKind::EpochDate { divisor: 1.0 };
        assert_eq!(
            kind.decode(Some(&json!("yesterday"))),
            FieldValue::Timestamp(DateTime::UNIX_EPOCH)
        );
    }

    #[test]
    fn binary_is_base64_on_the_wire() {
        let stored = FieldKind::Binary
            .encode("b", FieldValue::Bytes(b"hello".to_vec()))
            .unwrap();
        assert_eq!(stored, json!("aGVsbG8="));
        assert_eq!(
            FieldKind::Binary.decode(Some(&stored)),
            FieldValue::Bytes(b"hello".to_vec())
        );
    }

    #[test]
    fn scalars_are_coerced_on_write() {
        assert_eq!(
            FieldKind::Integer.encode("n", "42".into()).unwrap(),
            json!(42)
        );
        assert_eq!(
            FieldKind::String.encode("s", 7_i64.into()).unwrap(),
            json!("7")
        );
        assert_eq!(
            FieldKind::Boolean.encode("b", "TRUE".into()).unwrap(),
            json!(true)
        );
        assert!(FieldKind::Integer.encode("n", "many".into()).is_err());
    }

    #[test]
    fn single_value_is_wrapped_for_array_fields() {
        assert_eq!(
            FieldKind::Array.encode("tags", "one".into()).unwrap(),
            json!(["one"])
        );
    }

    #[test]
    fn foreign_key_derives_sibling_id_field() {
        let spec = FieldSpec::new(
            "device",
            FieldKind::ForeignKey {
                model: "Device",
                id_field: None,
            },
        );
        assert_eq!(spec.id_field().as_deref(), Some("device_id"));
        assert!(spec.kind.encode("device", "x".into()).is_err());
    }
}
