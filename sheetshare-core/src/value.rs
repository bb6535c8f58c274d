//! Typed cell values and column types.
//!
//! Every column declares one [`DType`]; every cell holds a [`CellValue`].
//! Each type has a "missing" sentinel which is distinct from an empty
//! string: [`CellValue::Missing`] for integer, boolean, datetime and text
//! columns, and a NaN [`CellValue::Float`] for float columns.
//!
//! On the wire a cell is plain JSON. Missing values (and NaN floats) are
//! written as `null`, datetimes as ISO-8601 strings.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// Wire format for datetime cells.
pub const DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Declared scalar type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Integer,
    Float,
    Boolean,
    #[serde(rename = "datetime")]
    DateTime,
    Text,
}

impl DType {
    pub const ALL: [DType; 5] = [
        DType::Integer,
        DType::Float,
        DType::Boolean,
        DType::DateTime,
        DType::Text,
    ];

    /// The typed "no value" marker for this column type.
    pub fn missing(self) -> CellValue {
        match self {
            DType::Float => CellValue::Float(f64::NAN),
            DType::Integer | DType::Boolean | DType::DateTime | DType::Text => CellValue::Missing,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DType::Integer => "integer",
            DType::Float => "float",
            DType::Boolean => "boolean",
            DType::DateTime => "datetime",
            DType::Text => "text",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accepts the canonical names plus the usual dataframe spellings
/// (`int64`, `float64`, `bool`, `datetime64`, `object`, `str`).
impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "integer" | "int" | "int64" | "i64" => Ok(DType::Integer),
            "float" | "float64" | "f64" | "double" => Ok(DType::Float),
            "boolean" | "bool" => Ok(DType::Boolean),
            "datetime" | "datetime64" | "date" | "timestamp" => Ok(DType::DateTime),
            "text" | "string" | "str" | "object" => Ok(DType::Text),
            other => Err(format!("unknown column type `{other}`")),
        }
    }
}

/// A single stored cell.
#[derive(Debug, Clone, Default)]
pub enum CellValue {
    #[default]
    Missing,
    Int(i64),
    Float(f64),
    Bool(bool),
    DateTime(NaiveDateTime),
    Text(String),
}

impl CellValue {
    /// True for the missing sentinel of any type, including NaN floats.
    pub fn is_missing(&self) -> bool {
        match self {
            CellValue::Missing => true,
            CellValue::Float(f) => f.is_nan(),
            _ => false,
        }
    }

    /// Store a raw JSON value without any type coercion.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => CellValue::Missing,
            Value::Bool(b) => CellValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => CellValue::Int(i),
                None => CellValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => CellValue::Text(s.clone()),
            other => CellValue::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            CellValue::Missing => Value::Null,
            CellValue::Int(i) => Value::from(*i),
            // NaN and infinities have no JSON form; `from_f64` yields None for them.
            CellValue::Float(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            CellValue::Bool(b) => Value::Bool(*b),
            CellValue::DateTime(dt) => Value::String(dt.format(DATETIME_FORMAT).to_string()),
            CellValue::Text(s) => Value::String(s.clone()),
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            CellValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CellValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// NaN floats compare equal to each other so that a reverted table equals
/// its original even when it holds missing float cells.
impl PartialEq for CellValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (CellValue::Missing, CellValue::Missing) => true,
            (CellValue::Int(a), CellValue::Int(b)) => a == b,
            (CellValue::Float(a), CellValue::Float(b)) => a == b || (a.is_nan() && b.is_nan()),
            (CellValue::Bool(a), CellValue::Bool(b)) => a == b,
            (CellValue::DateTime(a), CellValue::DateTime(b)) => a == b,
            (CellValue::Text(a), CellValue::Text(b)) => a == b,
            _ => false,
        }
    }
}

impl Serialize for CellValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for CellValue {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(CellValue::from_json(&value))
    }
}

impl From<i64> for CellValue {
    fn from(v: i64) -> Self {
        CellValue::Int(v)
    }
}

impl From<f64> for CellValue {
    fn from(v: f64) -> Self {
        CellValue::Float(v)
    }
}

impl From<bool> for CellValue {
    fn from(v: bool) -> Self {
        CellValue::Bool(v)
    }
}

impl From<&str> for CellValue {
    fn from(v: &str) -> Self {
        CellValue::Text(v.to_string())
    }
}

impl From<String> for CellValue {
    fn from(v: String) -> Self {
        CellValue::Text(v)
    }
}

/// Infer a column type from raw JSON values.
///
/// Nulls are ignored. All integers → integer, any mix of numbers → float,
/// all booleans → boolean, anything else (including an all-null column)
/// → text. Datetimes are never inferred; strings stay text unless the
/// caller declares the column explicitly.
pub fn infer_dtype<'a>(values: impl IntoIterator<Item = &'a Value>) -> DType {
    let mut inferred: Option<DType> = None;
    for value in values {
        let this = match value {
            Value::Null => continue,
            Value::Bool(_) => DType::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => DType::Integer,
            Value::Number(_) => DType::Float,
            _ => return DType::Text,
        };
        inferred = Some(match (inferred, this) {
            (None, t) => t,
            (Some(a), b) if a == b => a,
            (Some(DType::Integer), DType::Float) | (Some(DType::Float), DType::Integer) => {
                DType::Float
            }
            _ => return DType::Text,
        });
    }
    inferred.unwrap_or(DType::Text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_sentinels() {
        assert_eq!(DType::Integer.missing(), CellValue::Missing);
        assert!(DType::Float.missing().is_missing());
        assert!(matches!(DType::Float.missing(), CellValue::Float(f) if f.is_nan()));
        assert!(!CellValue::Text(String::new()).is_missing());
    }

    #[test]
    fn test_nan_serializes_as_null() {
        assert_eq!(CellValue::Float(f64::NAN).to_json(), Value::Null);
        assert_eq!(CellValue::Missing.to_json(), Value::Null);
        assert_eq!(CellValue::Float(1.5).to_json(), json!(1.5));
    }

    #[test]
    fn test_datetime_wire_format() {
        let dt = NaiveDateTime::parse_from_str("2024-03-01T12:30:00", DATETIME_FORMAT).unwrap();
        assert_eq!(CellValue::DateTime(dt).to_json(), json!("2024-03-01T12:30:00"));
    }

    #[test]
    fn test_from_json_raw() {
        assert_eq!(CellValue::from_json(&json!(7)), CellValue::Int(7));
        assert_eq!(CellValue::from_json(&json!("7")), CellValue::Text("7".into()));
        assert_eq!(CellValue::from_json(&json!(null)), CellValue::Missing);
        assert_eq!(CellValue::from_json(&json!([1, 2])), CellValue::Text("[1,2]".into()));
    }

    #[test]
    fn test_infer_dtype() {
        assert_eq!(infer_dtype(&[json!(1), json!(2), json!(null)]), DType::Integer);
        assert_eq!(infer_dtype(&[json!(1), json!(2.5)]), DType::Float);
        assert_eq!(infer_dtype(&[json!(true), json!(false)]), DType::Boolean);
        assert_eq!(infer_dtype(&[json!(1), json!("a")]), DType::Text);
        assert_eq!(infer_dtype(&[json!(true), json!(1)]), DType::Text);
        assert_eq!(infer_dtype(&[json!(null)]), DType::Text);
    }

    #[test]
    fn test_dtype_from_str_aliases() {
        assert_eq!("int64".parse::<DType>().unwrap(), DType::Integer);
        assert_eq!("Float64".parse::<DType>().unwrap(), DType::Float);
        assert_eq!("object".parse::<DType>().unwrap(), DType::Text);
        assert_eq!("datetime".parse::<DType>().unwrap(), DType::DateTime);
        assert!("complex".parse::<DType>().is_err());
    }

    #[test]
    fn test_dtype_serde_names() {
        assert_eq!(serde_json::to_value(DType::DateTime).unwrap(), json!("datetime"));
        assert_eq!(serde_json::to_value(DType::Boolean).unwrap(), json!("boolean"));
    }
}
