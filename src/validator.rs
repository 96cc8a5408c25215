//! Response assertions: status, headers and body paths.

use crate::context::VariableContext;
use crate::http::HttpResponse;
use crate::interpolate::{has_placeholders, interpolate};
use crate::model::{PathAssertion, VerificationDefinition};
use crate::path::JsonPath;
use crate::value::{is_empty_value, loose_eq, to_number, to_string_form};
use anyhow::{anyhow, Result};
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

/// Comparison applied by a body path assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssertionOp {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    GreaterThan,
    LessThan,
    Exists,
    NotExists,
    IsNull,
    IsNotNull,
    IsEmpty,
    IsNotEmpty,
}

impl AssertionOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssertionOp::Equals => "equals",
            AssertionOp::Contains => "contains",
            AssertionOp::StartsWith => "startsWith",
            AssertionOp::EndsWith => "endsWith",
            AssertionOp::Matches => "matches",
            AssertionOp::GreaterThan => "greaterThan",
            AssertionOp::LessThan => "lessThan",
            AssertionOp::Exists => "exists",
            AssertionOp::NotExists => "notExists",
            AssertionOp::IsNull => "isNull",
            AssertionOp::IsNotNull => "isNotNull",
            AssertionOp::IsEmpty => "isEmpty",
            AssertionOp::IsNotEmpty => "isNotEmpty",
        }
    }

    const ALL: [AssertionOp; 13] = [
        AssertionOp::Equals,
        AssertionOp::Contains,
        AssertionOp::StartsWith,
        AssertionOp::EndsWith,
        AssertionOp::Matches,
        AssertionOp::GreaterThan,
        AssertionOp::LessThan,
        AssertionOp::Exists,
        AssertionOp::NotExists,
        AssertionOp::IsNull,
        AssertionOp::IsNotNull,
        AssertionOp::IsEmpty,
        AssertionOp::IsNotEmpty,
    ];
}

impl fmt::Display for AssertionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssertionOp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let name = s.trim();
        AssertionOp::ALL
            .into_iter()
            .find(|op| op.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| anyhow!("Unknown assertion type: '{name}'"))
    }
}

/// Check `response` against `verification`, collecting every failure.
///
/// When `ctx` is given, expected header values and string expectations
/// containing `${...}` are interpolated first. An empty result means
/// the response passed.
pub fn verify(
    response: &HttpResponse,
    verification: &VerificationDefinition,
    ctx: Option<&VariableContext>,
) -> Vec<String> {
    let mut failures = Vec::new();

    if let Some(expected) = verification.status_code {
        if expected != response.status {
            failures.push(format!(
                "Status code assertion failed: expected {} but got {}",
                expected, response.status
            ));
        }
    }

    failures.extend(verify_headers(response, verification, ctx));

    if !verification.json_path_assertions.is_empty() {
        let body: std::result::Result<Value, _> = serde_json::from_str(&response.body);
        for assertion in &verification.json_path_assertions {
            let outcome = match &body {
                Ok(root) => check_assertion(root, assertion, ctx),
                Err(err) => Some(format!(
                    "Error evaluating JSONPath '{}': response body is not valid JSON ({err})",
                    assertion.path
                )),
            };
            match outcome {
                Some(message) => {
                    warn!("Assertion failed: {message}");
                    failures.push(message);
                }
                None => debug!("Assertion passed for path: {}", assertion.path),
            }
        }
    }

    failures
}

fn verify_headers(
    response: &HttpResponse,
    verification: &VerificationDefinition,
    ctx: Option<&VariableContext>,
) -> Vec<String> {
    let mut failures = Vec::new();
    for (name, expected) in &verification.headers {
        let expected = match ctx {
            Some(ctx) if has_placeholders(expected) => interpolate(expected, ctx),
            _ => expected.clone(),
        };
        match response.header(name) {
            None => failures.push(format!(
                "Header assertion failed: header '{name}' not found in response"
            )),
            Some(actual) if actual != expected => failures.push(format!(
                "Header assertion failed for '{name}': expected '{expected}' but got '{actual}'"
            )),
            Some(_) => {}
        }
    }
    failures
}

/// Evaluate one path assertion against a parsed body. `None` = passed.
pub fn check_assertion(
    root: &Value,
    assertion: &PathAssertion,
    ctx: Option<&VariableContext>,
) -> Option<String> {
    let path = assertion.path.as_str();

    let op = match assertion.kind.parse::<AssertionOp>() {
        Ok(op) => op,
        Err(err) => return Some(err.to_string()),
    };

    let parsed = match JsonPath::parse(path) {
        Ok(parsed) => parsed,
        Err(err) => return Some(format!("Error evaluating JSONPath '{path}': {err:#}")),
    };

    let expected = match (&assertion.expected, ctx) {
        (Value::String(s), Some(ctx)) if has_placeholders(s) => {
            let resolved = interpolate(s, ctx);
            debug!("After variable replacement, expected value: {resolved}");
            Value::String(resolved)
        }
        (value, _) => value.clone(),
    };

    let actual = match (parsed.evaluate(root), op) {
        (None, AssertionOp::NotExists) => return None,
        (Some(_), AssertionOp::NotExists) => {
            return Some(format!(
                "JSONPath should not exist but was found: '{path}'"
            ))
        }
        (None, AssertionOp::Exists) => {
            return Some(format!("JSONPath does not exist: '{path}'"))
        }
        (None, _) => return Some(format!("JSONPath not found: '{path}'")),
        (Some(actual), _) => actual,
    };

    compare(op, path, &actual, &expected).err()
}

fn compare(
    op: AssertionOp,
    path: &str,
    actual: &Value,
    expected: &Value,
) -> std::result::Result<(), String> {
    let shown = to_string_form(actual);
    let wanted = to_string_form(expected);
    let fail = |what: &str| -> std::result::Result<(), String> {
        Err(format!(
            "JSONPath assertion failed for '{path}': expected {what}'{wanted}' but got '{shown}'"
        ))
    };

    match op {
        AssertionOp::Exists | AssertionOp::NotExists => Ok(()),
        AssertionOp::IsNull if actual.is_null() => Ok(()),
        AssertionOp::IsNull => Err(format!(
            "Expected null for path '{path}' but got: '{shown}'"
        )),
        AssertionOp::IsNotNull if !actual.is_null() => Ok(()),
        AssertionOp::IsNotNull => {
            Err(format!("Expected non-null value for path '{path}'"))
        }
        AssertionOp::IsEmpty if is_empty_value(actual) => Ok(()),
        AssertionOp::IsEmpty => Err(format!(
            "Expected empty value for path '{path}' but got: '{shown}'"
        )),
        AssertionOp::IsNotEmpty if !is_empty_value(actual) => Ok(()),
        AssertionOp::IsNotEmpty => {
            Err(format!("Expected non-empty value for path '{path}'"))
        }
        AssertionOp::Equals if loose_eq(actual, expected) => Ok(()),
        AssertionOp::Equals => fail(""),
        AssertionOp::Contains if contains(actual, expected) => Ok(()),
        AssertionOp::Contains => fail("to contain "),
        AssertionOp::StartsWith if !actual.is_null() && shown.starts_with(&wanted) => {
            Ok(())
        }
        AssertionOp::StartsWith => fail("to start with "),
        AssertionOp::EndsWith if !actual.is_null() && shown.ends_with(&wanted) => Ok(()),
        AssertionOp::EndsWith => fail("to end with "),
        AssertionOp::Matches if matches(actual, &wanted) => Ok(()),
        AssertionOp::Matches => fail("to match pattern "),
        AssertionOp::GreaterThan
            if ordering(actual, expected) == Some(Ordering::Greater) =>
        {
            Ok(())
        }
        AssertionOp::GreaterThan => fail("greater than "),
        AssertionOp::LessThan if ordering(actual, expected) == Some(Ordering::Less) => {
            Ok(())
        }
        AssertionOp::LessThan => fail("less than "),
    }
}

/// Key-or-value membership for objects, element membership for arrays,
/// substring otherwise.
fn contains(actual: &Value, expected: &Value) -> bool {
    match actual {
        Value::Null => false,
        Value::Object(map) => {
            let key = to_string_form(expected);
            map.contains_key(&key) || map.values().any(|v| loose_eq(v, expected))
        }
        Value::Array(items) => items.iter().any(|item| loose_eq(item, expected)),
        _ => to_string_form(actual).contains(&to_string_form(expected)),
    }
}

fn matches(actual: &Value, pattern: &str) -> bool {
    if actual.is_null() {
        return false;
    }
    match Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => re.is_match(&to_string_form(actual)),
        Err(err) => {
            warn!("Invalid regex pattern '{pattern}': {err}");
            false
        }
    }
}

/// Numeric when both sides are numbers or numeric strings, otherwise
/// lexicographic on the string forms. Null never orders.
fn ordering(actual: &Value, expected: &Value) -> Option<Ordering> {
    if actual.is_null() || expected.is_null() {
        return None;
    }
    match (to_number(actual), to_number(expected)) {
        (Some(a), Some(b)) => a.partial_cmp(&b),
        _ => Some(to_string_form(actual).cmp(&to_string_form(expected))),
    }
}
