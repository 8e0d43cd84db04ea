use std::fmt;

use chrono::{DateTime, FixedOffset, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{Error, Result, metadata::FieldType, object::ObjectId};

/// A field value held by an object in the session arena.
///
/// Equality is semantic rather than structural: the two date wrappers
/// compare by the instant they denote, so rewriting a date with an
/// equivalent one in another offset is not a change.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    DateTime(DateTime<FixedOffset>),
    Timestamp(DateTime<Utc>),
    Uuid(Uuid),
    Json(JsonValue),
    Embedded(ObjectId),
    Reference(ObjectId),
}

/// Shared null for lookups of absent fields.
pub(crate) static NULL: Value = Value::Null;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_embedded(&self) -> Option<ObjectId> {
        match self {
            Value::Embedded(id) => Some(*id),
            _ => None,
        }
    }

    pub fn as_reference(&self) -> Option<ObjectId> {
        match self {
            Value::Reference(id) => Some(*id),
            _ => None,
        }
    }

    /// The UTC instant of either date wrapper.
    pub fn instant(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(dt.with_timezone(&Utc)),
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    pub(crate) fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Timestamp(_) => "timestamp",
            Value::Uuid(_) => "uuid",
            Value::Json(_) => "json",
            Value::Embedded(_) => "embedded",
            Value::Reference(_) => "reference",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (self.instant(), other.instant()) {
            return a == b;
        }
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            (Value::Json(a), Value::Json(b)) => a == b,
            (Value::Embedded(a), Value::Embedded(b)) => a == b,
            (Value::Reference(a), Value::Reference(b)) => a == b,
            _ => false,
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_owned())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int(i64::from(value))
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<Uuid> for Value {
    fn from(value: Uuid) -> Self {
        Value::Uuid(value)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(value: DateTime<Utc>) -> Self {
        Value::Timestamp(value)
    }
}

impl From<DateTime<FixedOffset>> for Value {
    fn from(value: DateTime<FixedOffset>) -> Self {
        Value::DateTime(value)
    }
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        Value::Json(value)
    }
}

impl From<Identifier> for Value {
    fn from(value: Identifier) -> Self {
        value.to_value()
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Identifier of a top-level document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identifier {
    Int(i64),
    String(String),
    Uuid(Uuid),
}

impl Identifier {
    pub fn to_value(&self) -> Value {
        match self {
            Identifier::Int(v) => Value::Int(*v),
            Identifier::String(v) => Value::String(v.clone()),
            Identifier::Uuid(v) => Value::Uuid(*v),
        }
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(v) => Some(Identifier::Int(*v)),
            Value::String(v) => Some(Identifier::String(v.clone())),
            Value::Uuid(v) => Some(Identifier::Uuid(*v)),
            _ => None,
        }
    }

    pub fn to_json(&self) -> JsonValue {
        match self {
            Identifier::Int(v) => JsonValue::from(*v),
            Identifier::String(v) => JsonValue::String(v.clone()),
            Identifier::Uuid(v) => JsonValue::String(v.to_string()),
        }
    }

    /// Decode a stored identifier using the declared identifier type.
    pub fn from_json(json: &JsonValue, ty: FieldType) -> Result<Self> {
        let invalid = || Error::InvalidValue {
            field: "_id".into(),
            detail: format!("{json} is not a valid {ty:?} identifier"),
        };
        match (ty, json) {
            (FieldType::Int, JsonValue::Number(n)) => n.as_i64().map(Identifier::Int).ok_or_else(invalid),
            (FieldType::Uuid, JsonValue::String(s)) => Uuid::parse_str(s)
                .map(Identifier::Uuid)
                .map_err(|_| invalid()),
            (FieldType::String | FieldType::Id, JsonValue::String(s)) => Ok(Identifier::String(s.clone())),
            (FieldType::Id, JsonValue::Number(n)) => n.as_i64().map(Identifier::Int).ok_or_else(invalid),
            _ => Err(invalid()),
        }
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Identifier::Int(value)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Identifier::String(value.to_owned())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Identifier::String(value)
    }
}

impl From<Uuid> for Identifier {
    fn from(value: Uuid) -> Self {
        Identifier::Uuid(value)
    }
}

impl From<&Identifier> for Identifier {
    fn from(value: &Identifier) -> Self {
        value.clone()
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Int(v) => write!(f, "{v}"),
            Identifier::String(v) => f.write_str(v),
            Identifier::Uuid(v) => write!(f, "{v}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn dates_compare_by_instant_across_wrappers() {
        let utc = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        let shifted = utc.with_timezone(&offset);
        assert_eq!(Value::Timestamp(utc), Value::DateTime(shifted));
        assert_ne!(
            Value::Timestamp(utc),
            Value::Timestamp(utc + chrono::Duration::seconds(1))
        );
    }

    #[test]
    fn distinct_types_never_equal() {
        assert_ne!(Value::Int(1), Value::Float(1.0));
        assert_ne!(Value::String("1".into()), Value::Int(1));
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
    }

    #[test]
    fn identifier_decodes_by_declared_type() {
        let id = Uuid::new_v4();
        assert_eq!(
            Identifier::from_json(&json!(id.to_string()), FieldType::Uuid).unwrap(),
            Identifier::Uuid(id)
        );
        assert_eq!(
            Identifier::from_json(&json!(7), FieldType::Int).unwrap(),
            Identifier::Int(7)
        );
        assert!(Identifier::from_json(&json!("x"), FieldType::Int).is_err());
    }
}
