//! Copies values from a response body into the variable context.

use crate::context::{Provenance, VariableContext};
use crate::model::ExtractionRule;
use crate::path::JsonPath;
use serde_json::Value;
use tracing::{debug, warn};

/// Apply `rules` to `body`, storing each result in `ctx` with
/// provenance `(step_name, rule.from)`.
///
/// Failures never abort: a rule that finds nothing stores its default
/// when one is configured and is otherwise skipped with a warning.
/// Returns the number of variables written.
pub fn extract(
    body: &str,
    rules: &[ExtractionRule],
    ctx: &mut VariableContext,
    step_name: &str,
) -> usize {
    if rules.is_empty() {
        return 0;
    }

    let parsed: Option<Value> = match serde_json::from_str(body) {
        Ok(value) => Some(value),
        Err(err) => {
            warn!("Step '{step_name}': response body is not valid JSON: {err}");
            None
        }
    };

    let mut written = 0;
    for rule in rules {
        let found = parsed
            .as_ref()
            .and_then(|root| lookup(root, &rule.from, step_name));

        let value = match (found, &rule.default_value) {
            (Some(value), _) if !value.is_null() => value,
            (_, Some(default)) => {
                debug!(
                    "No value at '{}', storing default for '{}'",
                    rule.from, rule.store_to
                );
                default.clone()
            }
            (Some(null), None) => null,
            (None, None) => {
                warn!(
                    "Step '{}': nothing extracted from '{}' into '{}'",
                    step_name, rule.from, rule.store_to
                );
                continue;
            }
        };

        if ctx.contains(&rule.store_to) {
            debug!("Overwriting variable '{}'", rule.store_to);
        }
        debug!("Extracted {} = {} from '{}'", rule.store_to, value, rule.from);
        ctx.set(
            rule.store_to.clone(),
            value,
            Some(Provenance::new(step_name, rule.from.clone())),
        );
        written += 1;
    }
    written
}

fn lookup(root: &Value, expression: &str, step_name: &str) -> Option<Value> {
    match JsonPath::parse(expression) {
        Ok(path) => path.evaluate(root),
        Err(err) => {
            warn!("Step '{step_name}': {err:#}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extracts_with_provenance() {
        let mut ctx = VariableContext::new();
        let rules = vec![
            ExtractionRule::new("$.id", "userId"),
            ExtractionRule::new("$.profile", "profile"),
        ];
        let written = extract(
            r#"{"id": 42, "profile": {"age": 30}}"#,
            &rules,
            &mut ctx,
            "create user",
        );

        assert_eq!(written, 2);
        assert_eq!(ctx.get("userId"), Some(&json!(42)));
        assert_eq!(ctx.get("profile"), Some(&json!({"age": 30})));
        let tracked = ctx.provenance("userId").unwrap();
        assert_eq!(tracked.source_step, "create user");
        assert_eq!(tracked.path, "$.id");
    }

    #[test]
    fn test_missing_path_uses_default() {
        let mut ctx = VariableContext::new();
        let rules = vec![
            ExtractionRule::new("$.nickname", "nick").with_default(json!("N/A")),
            ExtractionRule::new("$.other", "other"),
        ];
        extract(r#"{"name": "Alice"}"#, &rules, &mut ctx, "s");

        assert_eq!(ctx.get("nick"), Some(&json!("N/A")));
        assert!(!ctx.contains("other"));
    }

    #[test]
    fn test_null_value_prefers_default() {
        let mut ctx = VariableContext::new();
        let rules = vec![
            ExtractionRule::new("$.a", "a").with_default(json!(0)),
            ExtractionRule::new("$.a", "raw"),
        ];
        extract(r#"{"a": null}"#, &rules, &mut ctx, "s");

        assert_eq!(ctx.get("a"), Some(&json!(0)));
        assert_eq!(ctx.get("raw"), Some(&Value::Null));
    }

    #[test]
    fn test_malformed_body_and_bad_path_are_not_fatal() {
        let mut ctx = VariableContext::new();
        let rules = vec![
            ExtractionRule::new("$.id", "id"),
            ExtractionRule::new("$.id", "fallback").with_default(json!("none")),
        ];
        assert_eq!(extract("<html>", &rules, &mut ctx, "s"), 1);
        assert_eq!(ctx.get("fallback"), Some(&json!("none")));

        let rules = vec![ExtractionRule::new("$.x[", "x")];
        assert_eq!(extract("{}", &rules, &mut ctx, "s"), 0);
    }

    #[test]
    fn test_later_rules_see_overwrites() {
        let mut ctx = VariableContext::new();
        ctx.set("id", json!(1), None);
        extract(r#"{"id": 2}"#, &[ExtractionRule::new("id", "id")], &mut ctx, "s");
        assert_eq!(ctx.get("id"), Some(&json!(2)));
        assert!(ctx.provenance("id").is_some());
    }
}
