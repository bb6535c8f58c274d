//! Per-cell type coercion guard.
//!
//! Incoming edits arrive as raw JSON. Before a value reaches the table it is
//! coerced to the column's declared [`DType`]; a value that cannot be
//! coerced is rejected with [`TableError::TypeMismatch`] and the table is
//! left untouched.
//!
//! Rules, per declared type:
//! - integer: empty/null → missing; integer literals, and numeric literals
//!   with no fractional part (`"7.0"`), are accepted.
//! - float: empty/null → NaN; any floating literal.
//! - boolean: empty/null → missing; `true/yes/1/y/t` and `false/no/0/n/f`,
//!   case-insensitive.
//! - datetime: empty/null → missing; ISO-8601 and a few common date layouts.
//! - text: always succeeds, the value is stringified.
//!
//! With strict typing disabled the guard is a pass-through and the raw
//! value is stored as-is.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::Value;

use crate::table::TableError;
use crate::value::{CellValue, DType};

const TRUE_WORDS: &[&str] = &["true", "yes", "1", "y", "t"];
const FALSE_WORDS: &[&str] = &["false", "no", "0", "n", "f"];

const DATETIME_LAYOUTS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%Y/%m/%d %H:%M:%S",
];

const DATE_LAYOUTS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d.%m.%Y"];

/// Validates and converts raw cell input against a column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtypeGuard {
    strict: bool,
}

impl Default for DtypeGuard {
    fn default() -> Self {
        Self::strict()
    }
}

impl DtypeGuard {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Coerce every value to its column type.
    pub fn strict() -> Self {
        Self { strict: true }
    }

    /// Store raw values untouched.
    pub fn permissive() -> Self {
        Self { strict: false }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Coerce `raw` for storage in `column` of type `dtype`.
    pub fn coerce(&self, column: &str, raw: &Value, dtype: DType) -> Result<CellValue, TableError> {
        if !self.strict {
            return Ok(CellValue::from_json(raw));
        }
        coerce_value(raw, dtype).ok_or_else(|| TableError::TypeMismatch {
            column: column.to_string(),
            value: display_raw(raw),
            expected: dtype,
        })
    }
}

/// Strict coercion. `None` means the value is not representable in `dtype`.
pub fn coerce_value(raw: &Value, dtype: DType) -> Option<CellValue> {
    if dtype != DType::Text && is_blank(raw) {
        return Some(dtype.missing());
    }
    match dtype {
        DType::Integer => coerce_integer(raw),
        DType::Float => coerce_float(raw),
        DType::Boolean => coerce_boolean(raw),
        DType::DateTime => coerce_datetime(raw),
        DType::Text => Some(coerce_text(raw)),
    }
}

fn is_blank(raw: &Value) -> bool {
    match raw {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn coerce_integer(raw: &Value) -> Option<CellValue> {
    match raw {
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                return Some(CellValue::Int(i));
            }
            n.as_f64().and_then(whole_f64).map(CellValue::Int)
        }
        Value::String(s) => {
            let s = s.trim();
            if let Ok(i) = s.parse::<i64>() {
                return Some(CellValue::Int(i));
            }
            s.parse::<f64>().ok().and_then(whole_f64).map(CellValue::Int)
        }
        _ => None,
    }
}

/// `7.0` → 7; anything with a fractional part, NaN or out of range → None.
fn whole_f64(f: f64) -> Option<i64> {
    if f.is_finite() && f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

fn coerce_float(raw: &Value) -> Option<CellValue> {
    match raw {
        Value::Number(n) => n.as_f64().map(CellValue::Float),
        Value::String(s) => s.trim().parse::<f64>().ok().map(CellValue::Float),
        _ => None,
    }
}

fn coerce_boolean(raw: &Value) -> Option<CellValue> {
    let word = match raw {
        Value::Bool(b) => return Some(CellValue::Bool(*b)),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_ascii_lowercase(),
        _ => return None,
    };
    if TRUE_WORDS.contains(&word.as_str()) {
        Some(CellValue::Bool(true))
    } else if FALSE_WORDS.contains(&word.as_str()) {
        Some(CellValue::Bool(false))
    } else {
        None
    }
}

fn coerce_datetime(raw: &Value) -> Option<CellValue> {
    let Value::String(s) = raw else {
        return None;
    };
    parse_datetime(s.trim()).map(CellValue::DateTime)
}

/// Parse the datetime layouts the editor accepts. Offsets are normalised to UTC.
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_utc());
    }
    for layout in DATETIME_LAYOUTS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, layout) {
            return Some(dt);
        }
    }
    for layout in DATE_LAYOUTS {
        if let Ok(d) = NaiveDate::parse_from_str(s, layout) {
            return d.and_hms_opt(0, 0, 0);
        }
    }
    None
}

fn coerce_text(raw: &Value) -> CellValue {
    match raw {
        Value::Null => CellValue::Text(String::new()),
        Value::String(s) => CellValue::Text(s.clone()),
        other => CellValue::Text(other.to_string()),
    }
}

fn display_raw(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
