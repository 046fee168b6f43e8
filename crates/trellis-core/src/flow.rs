use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::condition::ConditionDefinition;
use crate::error::{Result, TrellisError};
use crate::value::VarMap;

/// A transition between steps, guarded by a condition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub target_step_id: String,
    pub condition: ConditionDefinition,
}

impl TransitionDefinition {
    pub fn always(target: impl Into<String>) -> Self {
        Self {
            target_step_id: target.into(),
            condition: ConditionDefinition::Always,
        }
    }

    pub fn when(target: impl Into<String>, condition: ConditionDefinition) -> Self {
        Self {
            target_step_id: target.into(),
            condition,
        }
    }
}

/// A named step: an optional tool invocation, an optional validator agent
/// judging the result, and ordered outgoing transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "VarMap::is_empty")]
    pub tool_params: VarMap,
    /// Destination variable → dotted path into the tool result.
    /// Missing paths are skipped, not faulted.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub save_mapping: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_agent: Option<String>,
    #[serde(default, skip_serializing_if = "VarMap::is_empty")]
    pub validator_params: VarMap,
    #[serde(default)]
    pub max_retries: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDefinition>,
}

impl StepDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            tool_name: None,
            tool_params: VarMap::new(),
            save_mapping: HashMap::new(),
            validator_agent: None,
            validator_params: VarMap::new(),
            max_retries: 0,
            transitions: Vec::new(),
        }
    }

    pub fn with_tool(mut self, name: impl Into<String>) -> Self {
        self.tool_name = Some(name.into());
        self
    }

    pub fn with_validator(mut self, agent: impl Into<String>, max_retries: usize) -> Self {
        self.validator_agent = Some(agent.into());
        self.max_retries = max_retries;
        self
    }

    pub fn with_transition(mut self, transition: TransitionDefinition) -> Self {
        self.transitions.push(transition);
        self
    }

    pub fn with_save_mapping(mut self, var: impl Into<String>, path: impl Into<String>) -> Self {
        self.save_mapping.insert(var.into(), path.into());
        self
    }
}

/// A flow of named steps with explicit transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFlowDefinition {
    pub name: String,
    pub steps: HashMap<String, StepDefinition>,
    pub entry_step_id: String,
    #[serde(default)]
    pub end_step_ids: HashSet<String>,
}

impl StepFlowDefinition {
    pub fn new(name: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: HashMap::new(),
            entry_step_id: entry.into(),
            end_step_ids: HashSet::new(),
        }
    }

    pub fn with_step(mut self, step: StepDefinition) -> Self {
        self.steps.insert(step.id.clone(), step);
        self
    }

    pub fn get_step(&self, step_id: &str) -> Result<&StepDefinition> {
        self.steps.get(step_id).ok_or_else(|| TrellisError::UnknownStep {
            flow: self.name.clone(),
            step: step_id.to_string(),
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.get_step(&self.entry_step_id)?;
        for step in self.steps.values() {
            for transition in &step.transitions {
                self.get_step(&transition.target_step_id)?;
            }
        }
        Ok(())
    }
}
