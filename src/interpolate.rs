//! `${name}` placeholder substitution.
//!
//! A single left-to-right pass: substituted text is never rescanned,
//! so a value containing `$` or `${...}` is emitted literally.

use crate::context::VariableContext;
use crate::model::TemplateVariable;
use tracing::{debug, warn};

/// Result of an interpolation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpolation {
    pub text: String,
    /// Placeholder names that had no value, in order of appearance.
    pub unresolved: Vec<String>,
}

/// Substitute every `${name}` whose name is known to `ctx`.
///
/// Unknown placeholders stay verbatim and are reported at `warn`.
pub fn interpolate(template: &str, ctx: &VariableContext) -> String {
    let result = interpolate_with_diagnostics(template, ctx);
    for name in &result.unresolved {
        warn!("Variable '{name}' not found in context, leaving placeholder");
    }
    result.text
}

/// Like [`interpolate`] but hands the diagnostics back to the caller
/// instead of logging them.
pub fn interpolate_with_diagnostics(
    template: &str,
    ctx: &VariableContext,
) -> Interpolation {
    substitute(template, "${", "}", |name| ctx.get_string(name))
}

/// True when `text` still holds a `${...}` placeholder.
pub fn has_placeholders(text: &str) -> bool {
    text.find("${")
        .is_some_and(|start| text[start + 2..].contains('}'))
}

/// Replace `{{name}}` markers with the effective value of the matching
/// template variable.
pub fn apply_template_variables(
    template: &str,
    variables: &[TemplateVariable],
) -> String {
    if variables.is_empty() || !template.contains("{{") {
        return template.to_string();
    }

    let result = substitute(template, "{{", "}}", |name| {
        let name = name.trim();
        variables
            .iter()
            .find(|v| v.name == name)
            .and_then(|v| v.effective_value())
            .map(str::to_string)
    });
    for name in &result.unresolved {
        warn!("Template variable '{name}' not found, keeping placeholder");
    }
    result.text
}

fn substitute<F>(template: &str, open: &str, close: &str, lookup: F) -> Interpolation
where
    F: Fn(&str) -> Option<String>,
{
    let mut text = String::with_capacity(template.len());
    let mut unresolved = Vec::new();
    let mut rest = template;

    while let Some(start) = rest.find(open) {
        let after_open = &rest[start + open.len()..];
        let Some(end) = after_open.find(close) else {
            break;
        };
        let name = &after_open[..end];
        text.push_str(&rest[..start]);

        match lookup(name) {
            Some(value) => {
                debug!("Replaced placeholder '{name}' with '{value}'");
                text.push_str(&value);
            }
            None => {
                unresolved.push(name.to_string());
                text.push_str(&rest[start..start + open.len() + end + close.len()]);
            }
        }
        rest = &after_open[end + close.len()..];
    }
    text.push_str(rest);

    Interpolation { text, unresolved }
}
