use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{Result, TrellisError};
use crate::value::Value;

/// Reserved boolean input present on every agent. Once true, remaining
/// graph items are skipped without a trace entry.
pub const STOP_FLAG_VAR: &str = "stop_agent_execution";

/// Reserved binding endpoint denoting the enclosing scope.
pub const CONTEXT_ENDPOINT: &str = "context";

/// Declared input or output variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarSpec {
    pub name: String,
    /// Optional type tag ("string", "bool", ...). Informational only.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl VarSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_tag: None,
            default: None,
        }
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Local variable with a fixed value, seeded into the scope at run start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalVar {
    pub name: String,
    pub value: Value,
}

impl LocalVar {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// Gate on a graph item: run only when `var` equals the literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhenClause {
    pub var: String,
    pub equals: Value,
}

/// A declared data-flow edge between two scope variables.
///
/// `from_item`/`to_item` reference item ids within the same graph, or the
/// reserved [`CONTEXT_ENDPOINT`] for the enclosing scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub from_item: String,
    pub from_var: String,
    pub to_item: String,
    pub to_var: String,
}

impl Binding {
    pub fn new(
        from_item: impl Into<String>,
        from_var: impl Into<String>,
        to_item: impl Into<String>,
        to_var: impl Into<String>,
    ) -> Self {
        Self {
            from_item: from_item.into(),
            from_var: from_var.into(),
            to_item: to_item.into(),
            to_var: to_var.into(),
        }
    }
}

/// Display-only canvas placement kept for the editor surface.
/// The interpreter never consults it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiPlacement {
    pub lane_index: usize,
    pub order: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<i64>,
}

/// One item in a lane: a reference to another agent plus its wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphItem {
    pub id: String,
    pub agent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<WhenClause>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bindings: Vec<Binding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui: Option<UiPlacement>,
}

impl GraphItem {
    pub fn new(id: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            agent: agent.into(),
            when: None,
            bindings: Vec::new(),
            ui: None,
        }
    }

    pub fn with_when(mut self, var: impl Into<String>, equals: Value) -> Self {
        self.when = Some(WhenClause {
            var: var.into(),
            equals,
        });
        self
    }

    pub fn with_binding(mut self, binding: Binding) -> Self {
        self.bindings.push(binding);
        self
    }
}

/// An ordered group of items. Lanes form barriers: every item in lane k
/// completes before lane k+1 starts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Lane {
    #[serde(default)]
    pub items: Vec<GraphItem>,
}

impl Lane {
    pub fn of(items: Vec<GraphItem>) -> Self {
        Self { items }
    }
}

/// The body of a composite agent: ordered lanes plus context-write bindings
/// applied after their source item completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub lanes: Vec<Lane>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ctx_bindings: Vec<Binding>,
}

/// Backend family for an atomic agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Prompt-template text generation through a pluggable backend.
    Text,
    /// Script body run by a pluggable script backend; faults soft-fail.
    Script,
    /// Shell command with cwd/timeout/allow-failure controls.
    Shell,
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Script => write!(f, "script"),
            Self::Shell => write!(f, "shell"),
        }
    }
}

/// Atomic (one executor backend) or composite (a graph of other agents).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentKind {
    Atomic { executor: ExecutorKind },
    Composite { graph: Graph },
}

/// A declaratively defined agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub kind: AgentKind,
    #[serde(default)]
    pub inputs: Vec<VarSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locals: Vec<LocalVar>,
    #[serde(default)]
    pub outputs: Vec<VarSpec>,
}

impl AgentDefinition {
    pub fn atomic(name: impl Into<String>, executor: ExecutorKind) -> Self {
        let mut def = Self {
            name: name.into(),
            title: None,
            description: None,
            kind: AgentKind::Atomic { executor },
            inputs: Vec::new(),
            locals: Vec::new(),
            outputs: Vec::new(),
        };
        def.ensure_stop_flag();
        def
    }

    pub fn composite(name: impl Into<String>, graph: Graph) -> Self {
        let mut def = Self {
            name: name.into(),
            title: None,
            description: None,
            kind: AgentKind::Composite { graph },
            inputs: Vec::new(),
            locals: Vec::new(),
            outputs: Vec::new(),
        };
        def.ensure_stop_flag();
        def
    }

    pub fn with_inputs(mut self, inputs: Vec<VarSpec>) -> Self {
        self.inputs = inputs;
        self.ensure_stop_flag();
        self
    }

    pub fn with_locals(mut self, locals: Vec<LocalVar>) -> Self {
        self.locals = locals;
        self.ensure_stop_flag();
        self
    }

    pub fn with_outputs(mut self, outputs: Vec<VarSpec>) -> Self {
        self.outputs = outputs;
        self
    }

    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, AgentKind::Atomic { .. })
    }

    pub fn graph(&self) -> Option<&Graph> {
        match &self.kind {
            AgentKind::Composite { graph } => Some(graph),
            AgentKind::Atomic { .. } => None,
        }
    }

    pub fn display_title(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.name)
    }

    /// Guarantee the reserved stop flag exists exactly once: purge it from
    /// locals, keep a single typed+defaulted copy in inputs.
    pub fn ensure_stop_flag(&mut self) {
        self.locals.retain(|local| local.name != STOP_FLAG_VAR);

        for var in &mut self.inputs {
            if var.name == STOP_FLAG_VAR {
                if var.type_tag.is_none() {
                    var.type_tag = Some("bool".to_string());
                }
                if var.default.is_none() {
                    var.default = Some(json!(false));
                }
                return;
            }
        }

        self.inputs.push(VarSpec {
            name: STOP_FLAG_VAR.to_string(),
            type_tag: Some("bool".to_string()),
            default: Some(json!(false)),
        });
    }

    /// Normalize after deserialization: re-ensure the stop flag, then
    /// validate. Repositories call this on every loaded document.
    pub fn normalize(&mut self) -> Result<()> {
        self.ensure_stop_flag();
        self.validate()
    }

    /// Structural validation: unique names per section, non-empty ids,
    /// binding endpoints referencing real items or the context.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(self.invalid("agent name must not be empty"));
        }

        for (label, names) in [
            ("input", self.inputs.iter().map(|v| v.name.as_str()).collect::<Vec<_>>()),
            ("local", self.locals.iter().map(|v| v.name.as_str()).collect()),
            ("output", self.outputs.iter().map(|v| v.name.as_str()).collect()),
        ] {
            let mut seen = HashSet::new();
            for name in names {
                if name.trim().is_empty() {
                    return Err(self.invalid(&format!("{label} variable name must not be empty")));
                }
                if !seen.insert(name) {
                    return Err(self.invalid(&format!(
                        "duplicate {label} variable name '{name}'"
                    )));
                }
            }
        }

        let stop_flags = self
            .inputs
            .iter()
            .filter(|v| v.name == STOP_FLAG_VAR)
            .count();
        if stop_flags != 1 {
            return Err(self.invalid("reserved stop flag must appear exactly once in inputs"));
        }

        if let Some(graph) = self.graph() {
            let mut item_ids = HashSet::new();
            for lane in &graph.lanes {
                for item in &lane.items {
                    if item.id.trim().is_empty() {
                        return Err(self.invalid("graph item id must not be empty"));
                    }
                    if item.agent.trim().is_empty() {
                        return Err(self.invalid(&format!(
                            "graph item '{}' has no agent reference",
                            item.id
                        )));
                    }
                    if !item_ids.insert(item.id.as_str()) {
                        return Err(self.invalid(&format!(
                            "duplicate graph item id '{}'",
                            item.id
                        )));
                    }
                }
            }
            let endpoint_ok = |id: &str| id == CONTEXT_ENDPOINT || item_ids.contains(id);
            let all_bindings = graph
                .lanes
                .iter()
                .flat_map(|l| l.items.iter().flat_map(|i| i.bindings.iter()))
                .chain(graph.ctx_bindings.iter());
            for binding in all_bindings {
                if !endpoint_ok(&binding.from_item) || !endpoint_ok(&binding.to_item) {
                    return Err(self.invalid(&format!(
                        "binding references unknown item ('{}' -> '{}')",
                        binding.from_item, binding.to_item
                    )));
                }
                if binding.from_var.trim().is_empty() || binding.to_var.trim().is_empty() {
                    return Err(self.invalid("binding variable names must not be empty"));
                }
            }
        }

        Ok(())
    }

    fn invalid(&self, message: &str) -> TrellisError {
        TrellisError::InvalidDefinition {
            agent: self.name.clone(),
            message: message.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_flag_injected_once() {
        let def = AgentDefinition::atomic("echo", ExecutorKind::Text);
        let flags: Vec<_> = def
            .inputs
            .iter()
            .filter(|v| v.name == STOP_FLAG_VAR)
            .collect();
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].default, Some(json!(false)));
        assert_eq!(flags[0].type_tag.as_deref(), Some("bool"));
    }

    #[test]
    fn stop_flag_not_duplicated() {
        let def = AgentDefinition::atomic("echo", ExecutorKind::Text)
            .with_inputs(vec![VarSpec::new(STOP_FLAG_VAR), VarSpec::new("text")]);
        let flags = def
            .inputs
            .iter()
            .filter(|v| v.name == STOP_FLAG_VAR)
            .count();
        assert_eq!(flags, 1);
        // existing declaration gets the default filled in
        let flag = def.inputs.iter().find(|v| v.name == STOP_FLAG_VAR).unwrap();
        assert_eq!(flag.default, Some(json!(false)));
    }

    #[test]
    fn stop_flag_purged_from_locals() {
        let def = AgentDefinition::atomic("echo", ExecutorKind::Text)
            .with_locals(vec![LocalVar::new(STOP_FLAG_VAR, json!(true))]);
        assert!(def.locals.is_empty());
        assert_eq!(
            def.inputs
                .iter()
                .filter(|v| v.name == STOP_FLAG_VAR)
                .count(),
            1
        );
    }

    #[test]
    fn duplicate_input_names_rejected() {
        let def = AgentDefinition::atomic("dup", ExecutorKind::Text)
            .with_inputs(vec![VarSpec::new("a"), VarSpec::new("a")]);
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate input"));
    }

    #[test]
    fn dangling_binding_rejected() {
        let graph = Graph {
            lanes: vec![Lane::of(vec![GraphItem::new("a", "child")
                .with_binding(Binding::new("ghost", "x", "a", "y"))])],
            ctx_bindings: vec![],
        };
        let def = AgentDefinition::composite("bad", graph);
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("unknown item"));
    }

    #[test]
    fn context_endpoint_is_valid() {
        let graph = Graph {
            lanes: vec![Lane::of(vec![GraphItem::new("a", "child")
                .with_binding(Binding::new(CONTEXT_ENDPOINT, "x", "a", "y"))])],
            ctx_bindings: vec![Binding::new("a", "y", CONTEXT_ENDPOINT, "out")],
        };
        let def = AgentDefinition::composite("good", graph);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn serde_round_trip_preserves_stop_flag() {
        let def = AgentDefinition::atomic("echo", ExecutorKind::Shell)
            .with_inputs(vec![VarSpec::new("command")]);
        let text = serde_json::to_string(&def).unwrap();
        let mut back: AgentDefinition = serde_json::from_str(&text).unwrap();
        back.normalize().unwrap();
        assert_eq!(
            back.inputs
                .iter()
                .filter(|v| v.name == STOP_FLAG_VAR)
                .count(),
            1
        );
        assert!(back.is_atomic());
    }
}
