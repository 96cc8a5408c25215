//! Coercion rules for loosely-typed JSON values.
//!
//! Values flowing through the context and the assertion engine are
//! plain [`serde_json::Value`]s; these helpers define how they turn
//! into strings and numbers and how two of them compare.

use regex::Regex;
use serde_json::{Number, Value};
use std::sync::LazyLock;

const FLOAT_EPSILON: f64 = 1e-4;

static NUMERIC_STRING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^-?\d+(\.\d+)?$").expect("failed to compile numeric regex")
});

/// Render a value the way interpolation and string comparisons see it.
///
/// Strings are emitted without quotes; structures use compact JSON.
pub fn to_string_form(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Numeric view of a value: JSON numbers, or strings holding a decimal
/// number such as `"-12.5"`.
pub fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) if is_numeric_string(s) => s.parse().ok(),
        _ => None,
    }
}

pub fn is_numeric_string(s: &str) -> bool {
    NUMERIC_STRING_RE.is_match(s)
}

fn is_float_like(n: &Number) -> bool {
    !(n.is_i64() || n.is_u64())
}

fn as_integer(n: &Number) -> Option<i128> {
    n.as_i64()
        .map(i128::from)
        .or_else(|| n.as_u64().map(i128::from))
}

/// Equality used by `equals` and by collection membership.
///
/// Numbers compare with an epsilon when either side is fractional and
/// exactly otherwise; booleans compare directly; everything else falls
/// back to string-form equality.
pub fn loose_eq(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::Number(a), Value::Number(b)) => {
            if is_float_like(a) || is_float_like(b) {
                match (a.as_f64(), b.as_f64()) {
                    (Some(a), Some(b)) => (a - b).abs() < FLOAT_EPSILON,
                    _ => false,
                }
            } else {
                as_integer(a) == as_integer(b)
            }
        }
        (Value::Bool(a), Value::Bool(b)) => a == b,
        _ => to_string_form(actual) == to_string_form(expected),
    }
}

/// Null, empty string, empty array or empty object.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}
