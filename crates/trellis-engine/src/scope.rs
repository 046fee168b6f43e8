//! Execution scope and binding resolution.
//!
//! The scope is two explicit maps: a flat last-write-wins namespace and a
//! per-item namespaced shadow copy, so ownership of every merged variable
//! stays unambiguous and independently testable.

use std::collections::HashMap;

use trellis_core::definition::{Binding, CONTEXT_ENDPOINT};
use trellis_core::value::{Value, VarMap};

#[derive(Debug, Clone, Default)]
pub struct ExecutionScope {
    flat: VarMap,
    by_item: HashMap<String, VarMap>,
}

impl ExecutionScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_flat(flat: VarMap) -> Self {
        Self {
            flat,
            by_item: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.flat.get(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.flat.insert(name.into(), value);
    }

    pub fn flat(&self) -> &VarMap {
        &self.flat
    }

    /// Read an item-namespaced variable, falling back to the bare name.
    pub fn lookup(&self, item_id: &str, var: &str) -> Option<&Value> {
        self.by_item
            .get(item_id)
            .and_then(|vars| vars.get(var))
            .or_else(|| self.flat.get(var))
    }

    /// Build a child's input map from the bindings targeting it.
    ///
    /// A `context` source reads the enclosing flat scope directly; any other
    /// source reads the namespaced copy of a prior item, with the bare-name
    /// fallback.
    pub fn child_inputs(&self, bindings: &[Binding], target_item: &str) -> VarMap {
        let mut inputs = VarMap::new();
        for binding in bindings {
            if binding.to_item != target_item {
                continue;
            }
            let value = if binding.from_item == CONTEXT_ENDPOINT {
                self.flat.get(&binding.from_var)
            } else {
                self.lookup(&binding.from_item, &binding.from_var)
            };
            if let Some(value) = value {
                inputs.insert(binding.to_var.clone(), value.clone());
            }
        }
        inputs
    }

    /// Merge a completed child's outputs: namespaced under the item id and
    /// flat (last write wins across items in declared order).
    pub fn absorb_child(&mut self, item_id: &str, outputs: &VarMap) {
        let namespaced = self.by_item.entry(item_id.to_string()).or_default();
        for (name, value) in outputs {
            namespaced.insert(name.clone(), value.clone());
        }
        for (name, value) in outputs {
            self.flat.insert(name.clone(), value.clone());
        }
    }

    /// Apply context-destination bindings sourced from a completed item.
    pub fn apply_context_bindings(&mut self, bindings: &[Binding], item_id: &str) {
        for binding in bindings {
            if binding.from_item != item_id || binding.to_item != CONTEXT_ENDPOINT {
                continue;
            }
            if let Some(value) = self
                .by_item
                .get(item_id)
                .and_then(|vars| vars.get(&binding.from_var))
                .cloned()
            {
                self.flat.insert(binding.to_var.clone(), value);
            }
        }
    }

    /// Final variable snapshot: flat names plus `"item.var"` shadow keys.
    pub fn snapshot(&self) -> VarMap {
        let mut vars = self.flat.clone();
        for (item_id, item_vars) in &self.by_item {
            for (name, value) in item_vars {
                vars.insert(format!("{item_id}.{name}"), value.clone());
            }
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_source_reads_flat_scope() {
        let mut scope = ExecutionScope::new();
        scope.set("body", json!("hello"));

        let bindings = vec![Binding::new(CONTEXT_ENDPOINT, "body", "echo1", "text")];
        let inputs = scope.child_inputs(&bindings, "echo1");
        assert_eq!(inputs.get("text"), Some(&json!("hello")));
    }

    #[test]
    fn item_source_prefers_namespaced_value() {
        let mut scope = ExecutionScope::new();
        scope.set("text", json!("stale"));
        scope.absorb_child("first", &VarMap::from([("text".to_string(), json!("fresh"))]));

        let bindings = vec![Binding::new("first", "text", "second", "text")];
        let inputs = scope.child_inputs(&bindings, "second");
        assert_eq!(inputs.get("text"), Some(&json!("fresh")));
    }

    #[test]
    fn item_source_falls_back_to_bare_name() {
        let mut scope = ExecutionScope::new();
        scope.set("text", json!("from context"));

        let bindings = vec![Binding::new("never_ran", "text", "second", "text")];
        let inputs = scope.child_inputs(&bindings, "second");
        assert_eq!(inputs.get("text"), Some(&json!("from context")));
    }

    #[test]
    fn bindings_for_other_items_ignored() {
        let mut scope = ExecutionScope::new();
        scope.set("x", json!(1));
        let bindings = vec![Binding::new(CONTEXT_ENDPOINT, "x", "other", "x")];
        assert!(scope.child_inputs(&bindings, "mine").is_empty());
    }

    #[test]
    fn absorb_writes_both_namespaces() {
        let mut scope = ExecutionScope::new();
        scope.absorb_child("echo1", &VarMap::from([("text".to_string(), json!("hi"))]));

        assert_eq!(scope.get("text"), Some(&json!("hi")));
        assert_eq!(scope.lookup("echo1", "text"), Some(&json!("hi")));

        let snapshot = scope.snapshot();
        assert_eq!(snapshot.get("text"), Some(&json!("hi")));
        assert_eq!(snapshot.get("echo1.text"), Some(&json!("hi")));
    }

    #[test]
    fn later_items_win_flat_keep_namespaced() {
        let mut scope = ExecutionScope::new();
        scope.absorb_child("a", &VarMap::from([("out".to_string(), json!("first"))]));
        scope.absorb_child("b", &VarMap::from([("out".to_string(), json!("second"))]));

        assert_eq!(scope.get("out"), Some(&json!("second")));
        assert_eq!(scope.lookup("a", "out"), Some(&json!("first")));
        assert_eq!(scope.lookup("b", "out"), Some(&json!("second")));
    }

    #[test]
    fn context_bindings_copy_into_flat() {
        let mut scope = ExecutionScope::new();
        scope.absorb_child("echo1", &VarMap::from([("text".to_string(), json!("hello"))]));

        let bindings = vec![Binding::new("echo1", "text", CONTEXT_ENDPOINT, "echo_output")];
        scope.apply_context_bindings(&bindings, "echo1");
        assert_eq!(scope.get("echo_output"), Some(&json!("hello")));
    }
}
