//! Scalar helpers shared by validation, mapping and loading.
//!
//! Raw cells arrive as JSON values, usually strings (Socrata returns every
//! column as text). Numbers are parsed leniently and every float that reaches
//! a record goes through [`sanitize_f64`] so NaN and infinities become null.

use chrono::NaiveDate;
use serde_json::{Number, Value};

/// A raw tabular record: column name to cell value.
pub type Row = serde_json::Map<String, Value>;

pub(crate) static NULL: Value = Value::Null;

/// Finite floats become JSON numbers; NaN and infinities become null.
pub fn sanitize_f64(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Replace non-finite numbers with null, recursively.
pub fn sanitize(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if !f.is_finite() => Value::Null,
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize).collect()),
        Value::Object(map) => Value::Object(sanitize_row(map)),
        other => other,
    }
}

pub fn sanitize_row(row: Row) -> Row {
    row.into_iter().map(|(k, v)| (k, sanitize(v))).collect()
}

/// Normalize European formatted numbers ("63,13", "1.234,56") to dotted form.
pub fn normalize_numeric_text(text: &str) -> String {
    let text = text.trim();
    if text.contains(',') {
        text.replace('.', "").replace(',', ".")
    } else {
        text.to_string()
    }
}

/// Numeric reading of a cell. Text is trimmed and normalized first.
/// Returns `None` for null, blank, non-numeric and non-finite values.
pub fn parse_number(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let normalized = normalize_numeric_text(s);
            if normalized.is_empty() {
                None
            } else {
                normalized.parse::<f64>().ok()
            }
        }
        _ => None,
    };
    parsed.filter(|f| f.is_finite())
}

/// Coerce a cell to a sanitized JSON number, or null when it is not numeric.
pub fn coerce_numeric(value: &Value) -> Value {
    parse_number(value).map(sanitize_f64).unwrap_or(Value::Null)
}

/// Integer reading of a cell ("2024", 2024, "2024.0").
pub fn parse_int(value: &Value) -> Option<i64> {
    let f = parse_number(value)?;
    if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
        Some(f as i64)
    } else {
        None
    }
}

/// ISO date reading. Timestamps ("2024-01-01T00:00:00.000") keep their date part.
pub fn parse_date(value: &Value) -> Option<NaiveDate> {
    let text = value.as_str()?.trim();
    let head = text.get(..10).unwrap_or(text);
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Trimmed text of a scalar cell, `None` when blank.
pub fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Stable textual form used for set membership and key comparison.
pub fn key_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    }
}

/// Composite key over `columns`. A null or absent cell is marked apart from
/// empty text, as a `NULLS NOT DISTINCT` unique index compares them.
pub fn composite_key(row: &Row, columns: &[String]) -> String {
    columns
        .iter()
        .map(|column| match row.get(column) {
            None | Some(Value::Null) => "\u{0}".to_string(),
            Some(value) => key_text(value),
        })
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

/// Boolean reading of a cell ("true", "si", "1", true).
pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "t" | "1" | "si" | "sí" | "s" | "x" => Some(true),
            "false" | "f" | "0" | "no" | "n" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}
