//! Path expressions for selecting values inside a JSON body.
//!
//! Evaluation is delegated to `jsonpath_rust`. The leading `$` is
//! optional, so `data.items` reads the same as `$.data.items`. A definite
//! path (no wildcard, descent, filter, slice or union) yields its single
//! match or nothing; any other path yields an array of every match.

use anyhow::{anyhow, bail, Result};
use jsonpath_rust::path::config::JsonPathConfig;
use jsonpath_rust::JsonPathInst;
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// A parsed path expression.
#[derive(Debug, Clone)]
pub struct JsonPath {
    source: String,
    inner: JsonPathInst,
    definite: bool,
}

impl JsonPath {
    pub fn parse(expression: &str) -> Result<Self> {
        let source = expression.trim();
        if source.is_empty() {
            bail!("empty path expression");
        }

        let normalized = normalize(source);
        let inner = JsonPathInst::from_str(&normalized)
            .map_err(|err| anyhow!("invalid path '{source}': {err}"))?;

        Ok(Self {
            source: source.to_string(),
            inner,
            definite: is_definite(&normalized),
        })
    }

    /// True when the path can match at most one value.
    pub fn is_definite(&self) -> bool {
        self.definite
    }

    /// Every value the path matches.
    pub fn select(&self, root: &Value) -> Vec<Value> {
        self.inner
            .find_slice(root, JsonPathConfig::default())
            .into_iter()
            .map(|found| Value::clone(&found))
            .collect()
    }

    /// The matched value of a definite path, or an array of all matches
    /// for an indefinite one. `None` means a definite path found nothing.
    pub fn evaluate(&self, root: &Value) -> Option<Value> {
        let matches = self.select(root);
        if self.definite {
            matches.into_iter().next()
        } else {
            Some(Value::Array(matches))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Parse `expression` and evaluate it against `root`.
pub fn read(root: &Value, expression: &str) -> Result<Option<Value>> {
    Ok(JsonPath::parse(expression)?.evaluate(root))
}

fn normalize(source: &str) -> String {
    if source.starts_with('$') {
        source.to_string()
    } else if source.starts_with('[') || source.starts_with('.') {
        format!("${source}")
    } else {
        format!("$.{source}")
    }
}

/// Lexical check over the expression, ignoring quoted names.
fn is_definite(path: &str) -> bool {
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut prev = '\0';
    for c in path.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None => match c {
                '\'' | '"' => quote = Some(c),
                '*' => return false,
                '.' if prev == '.' => return false,
                '[' => depth += 1,
                ']' => depth = depth.saturating_sub(1),
                '?' | ':' | ',' if depth > 0 => return false,
                _ => {}
            },
        }
        prev = c;
    }
    true
}
