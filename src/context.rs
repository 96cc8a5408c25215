//! Per-test-case variable store.

use crate::value::to_string_form;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Where a context variable came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// Name of the step that produced the value.
    pub step: String,
    /// Path expression the value was read from.
    pub path: String,
}

impl Provenance {
    pub fn new(step: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            path: path.into(),
        }
    }
}

/// A variable together with its provenance, kept for reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedVariable {
    pub value: Value,
    pub source_step: String,
    pub path: String,
}

/// Mutable name → value mapping shared by the steps of one test case.
///
/// A fresh context is created for every test case execution and is
/// never shared between cases.
#[derive(Debug, Clone, Default)]
pub struct VariableContext {
    variables: HashMap<String, Value>,
    tracking: BTreeMap<String, TrackedVariable>,
}

impl VariableContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `name`, replacing any previous value and its
    /// provenance.
    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: Value,
        provenance: Option<Provenance>,
    ) {
        let name = name.into();
        match provenance {
            Some(provenance) => {
                debug!(
                    "Variable set: {} = {} (from step: {}, path: {})",
                    name, value, provenance.step, provenance.path
                );
                self.tracking.insert(
                    name.clone(),
                    TrackedVariable {
                        value: value.clone(),
                        source_step: provenance.step,
                        path: provenance.path,
                    },
                );
            }
            None => {
                debug!("Variable set: {} = {}", name, value);
                self.tracking.remove(&name);
            }
        }
        self.variables.insert(name, value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// String form of a variable, as interpolation renders it.
    pub fn get_string(&self, name: &str) -> Option<String> {
        self.get(name).map(to_string_form)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    pub fn provenance(&self, name: &str) -> Option<&TrackedVariable> {
        self.tracking.get(name)
    }

    /// Snapshot of every variable.
    pub fn get_all(&self) -> BTreeMap<String, Value> {
        self.variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Snapshot of the variables that carry provenance.
    pub fn tracking(&self) -> BTreeMap<String, TrackedVariable> {
        self.tracking.clone()
    }

    pub fn len(&self) -> usize {
        self.variables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.variables.is_empty()
    }

    pub fn clear(&mut self) {
        self.variables.clear();
        self.tracking.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_and_get() {
        let mut ctx = VariableContext::new();
        assert!(ctx.is_empty());

        ctx.set("count", json!(3), None);
        ctx.set("name", json!("alice"), None);

        assert_eq!(ctx.get("count"), Some(&json!(3)));
        assert_eq!(ctx.get_string("count").as_deref(), Some("3"));
        assert_eq!(ctx.get_string("name").as_deref(), Some("alice"));
        assert!(ctx.get("missing").is_none());
        assert_eq!(ctx.len(), 2);
    }

    #[test]
    fn test_provenance_tracking() {
        let mut ctx = VariableContext::new();
        ctx.set(
            "userId",
            json!(7),
            Some(Provenance::new("create user", "$.id")),
        );

        let tracked = ctx.provenance("userId").unwrap();
        assert_eq!(tracked.value, json!(7));
        assert_eq!(tracked.source_step, "create user");
        assert_eq!(tracked.path, "$.id");

        // overwriting without provenance drops the stale record
        ctx.set("userId", json!(8), None);
        assert!(ctx.provenance("userId").is_none());
        assert_eq!(ctx.get("userId"), Some(&json!(8)));
    }

    #[test]
    fn test_snapshots_are_detached() {
        let mut ctx = VariableContext::new();
        ctx.set("a", json!(1), Some(Provenance::new("s", "$.a")));
        let snapshot = ctx.get_all();
        let tracking = ctx.tracking();

        ctx.clear();
        assert!(ctx.is_empty());
        assert_eq!(snapshot.get("a"), Some(&json!(1)));
        assert!(tracking.contains_key("a"));
    }
}
