use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A typed transition condition.
///
/// Comparison kinds read `var` from the scope and compare it against a
/// second variable (`other_var`) when one is named, otherwise against the
/// literal `value`. `Expression` defers to the sandboxed evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionDefinition {
    Always,
    Equals {
        var: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        other_var: Option<String>,
    },
    NotEquals {
        var: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        other_var: Option<String>,
    },
    GreaterThan {
        var: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        other_var: Option<String>,
    },
    LessThan {
        var: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        other_var: Option<String>,
    },
    Contains {
        var: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        other_var: Option<String>,
    },
    Expression { expression: String },
}

impl ConditionDefinition {
    pub fn equals(var: impl Into<String>, value: Value) -> Self {
        Self::Equals {
            var: var.into(),
            value: Some(value),
            other_var: None,
        }
    }

    pub fn expression(text: impl Into<String>) -> Self {
        Self::Expression {
            expression: text.into(),
        }
    }

    /// True for the catch-all condition.
    pub fn is_always(&self) -> bool {
        matches!(self, Self::Always)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serde_tagging() {
        let cond = ConditionDefinition::equals("status", json!("ok"));
        let text = serde_json::to_string(&cond).unwrap();
        assert!(text.contains(r#""type":"equals""#));
        let back: ConditionDefinition = serde_json::from_str(&text).unwrap();
        assert!(matches!(back, ConditionDefinition::Equals { .. }));
    }

    #[test]
    fn always_is_catch_all() {
        assert!(ConditionDefinition::Always.is_always());
        assert!(!ConditionDefinition::expression("x > 1").is_always());
    }
}
