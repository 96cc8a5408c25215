//! Step condition expressions.
//!
//! A condition is either a single comparison `<left> <op> <right>` or a
//! bare boolean literal. Operands are interpolated against the variable
//! context before the expression is tokenized.

use crate::context::VariableContext;
use crate::interpolate::interpolate;
use anyhow::{bail, Result};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Ge,
    Le,
    Gt,
    Lt,
    Contains,
    StartsWith,
    EndsWith,
}

impl Operator {
    /// Lookup order. Two-character comparisons come before their
    /// one-character prefixes.
    pub const PRIORITY: [Operator; 9] = [
        Operator::Eq,
        Operator::Ne,
        Operator::Ge,
        Operator::Le,
        Operator::Gt,
        Operator::Lt,
        Operator::Contains,
        Operator::StartsWith,
        Operator::EndsWith,
    ];

    pub fn token(&self) -> &'static str {
        match self {
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Ge => ">=",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Contains => " contains ",
            Operator::StartsWith => " startsWith ",
            Operator::EndsWith => " endsWith ",
        }
    }

    fn apply(&self, left: &str, right: &str) -> bool {
        match self {
            Operator::Eq => left == right,
            Operator::Ne => left != right,
            Operator::Contains => left.contains(right),
            Operator::StartsWith => left.starts_with(right),
            Operator::EndsWith => left.ends_with(right),
            Operator::Ge | Operator::Le | Operator::Gt | Operator::Lt => {
                let (Ok(l), Ok(r)) = (left.parse::<f64>(), right.parse::<f64>())
                else {
                    debug!(
                        "Non-numeric operands for '{}': '{}' vs '{}'",
                        self.token().trim(),
                        left,
                        right
                    );
                    return false;
                };
                match self {
                    Operator::Ge => l >= r,
                    Operator::Le => l <= r,
                    Operator::Gt => l > r,
                    _ => l < r,
                }
            }
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token().trim())
    }
}

/// A tokenized condition, operands already stripped of quotes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expression {
    Compare {
        left: String,
        op: Operator,
        right: String,
    },
    Literal(bool),
}

impl Expression {
    /// Tokenize an already interpolated expression.
    ///
    /// Operator tokens inside quoted operands are ignored. The chosen
    /// operator must occur exactly once and both sides must be
    /// non-empty.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let quoted = quoted_mask(text);

        for op in Operator::PRIORITY {
            let hits: Vec<usize> = text
                .match_indices(op.token())
                .map(|(idx, _)| idx)
                .filter(|idx| !quoted[*idx])
                .collect();

            match hits.as_slice() {
                [] => continue,
                [idx] => {
                    let left = text[..*idx].trim();
                    let right = text[*idx + op.token().len()..].trim();
                    if left.is_empty() || right.is_empty() {
                        bail!("operator '{op}' needs two operands in '{text}'");
                    }
                    return Ok(Expression::Compare {
                        left: strip_quotes(left).to_string(),
                        op,
                        right: strip_quotes(right).to_string(),
                    });
                }
                _ => bail!(
                    "operator '{op}' appears {} times in '{text}'",
                    hits.len()
                ),
            }
        }

        Ok(Expression::Literal(text.eq_ignore_ascii_case("true")))
    }

    pub fn eval(&self) -> bool {
        match self {
            Expression::Compare { left, op, right } => op.apply(left, right),
            Expression::Literal(value) => *value,
        }
    }
}

/// Evaluate `expression` against `ctx`, propagating tokenizer errors.
pub fn try_evaluate(expression: &str, ctx: &VariableContext) -> Result<bool> {
    if expression.trim().is_empty() {
        return Ok(true);
    }
    let resolved = interpolate(expression, ctx);
    let parsed = Expression::parse(&resolved)?;
    let outcome = parsed.eval();
    debug!("Condition '{expression}' -> '{resolved}' = {outcome}");
    Ok(outcome)
}

/// Evaluate `expression` against `ctx`. Errors degrade to `false`.
pub fn evaluate(expression: &str, ctx: &VariableContext) -> bool {
    try_evaluate(expression, ctx).unwrap_or_else(|err| {
        warn!("Error evaluating condition '{expression}': {err:#}");
        false
    })
}

fn strip_quotes(operand: &str) -> &str {
    let bytes = operand.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'\'' || first == b'"') {
            return &operand[1..operand.len() - 1];
        }
    }
    operand
}

/// Per-byte flag: true when the byte sits inside a quoted operand.
///
/// A quote opens a span only at the start of the text or after
/// whitespace, and closes it only before whitespace or the end, so an
/// apostrophe inside a word (often from an interpolated value) stays
/// literal. An unterminated quote masks nothing.
fn quoted_mask(text: &str) -> Vec<bool> {
    let bytes = text.as_bytes();
    let mut mask = vec![false; bytes.len()];
    let mut open: Option<(u8, usize)> = None;

    for (idx, &byte) in bytes.iter().enumerate() {
        let after_gap = idx == 0 || bytes[idx - 1].is_ascii_whitespace();
        let before_gap = idx + 1 == bytes.len() || bytes[idx + 1].is_ascii_whitespace();
        match open {
            Some((quote, start)) if byte == quote && before_gap => {
                mask[start..=idx].iter_mut().for_each(|m| *m = true);
                open = None;
            }
            Some(_) => {}
            None if (byte == b'\'' || byte == b'"') && after_gap => {
                open = Some((byte, idx))
            }
            None => {}
        }
    }
    mask
}
