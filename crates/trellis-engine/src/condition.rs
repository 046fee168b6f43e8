use tracing::warn;

use trellis_core::condition::ConditionDefinition;
use trellis_core::value::{Value, VarMap};

use crate::expr;

/// Evaluates typed transition conditions against a flat variable map.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// Never faults: comparison kinds degrade to false on missing or
    /// unorderable operands, and a rejected/failed expression resolves to
    /// false so one malformed condition cannot take down a transition table.
    pub fn evaluate(condition: &ConditionDefinition, vars: &VarMap) -> bool {
        match condition {
            ConditionDefinition::Always => true,

            ConditionDefinition::Equals {
                var,
                value,
                other_var,
            } => {
                let Some(left) = vars.get(var) else {
                    return false;
                };
                match rhs(vars, value, other_var) {
                    Some(right) => expr::value_eq(left, &right),
                    None => false,
                }
            }

            ConditionDefinition::NotEquals {
                var,
                value,
                other_var,
            } => {
                let left = vars.get(var).cloned().unwrap_or(Value::Null);
                match rhs(vars, value, other_var) {
                    Some(right) => !expr::value_eq(&left, &right),
                    None => !matches!(left, Value::Null),
                }
            }

            ConditionDefinition::GreaterThan {
                var,
                value,
                other_var,
            } => ordered(vars, var, value, other_var, |o| o == std::cmp::Ordering::Greater),

            ConditionDefinition::LessThan {
                var,
                value,
                other_var,
            } => ordered(vars, var, value, other_var, |o| o == std::cmp::Ordering::Less),

            ConditionDefinition::Contains {
                var,
                value,
                other_var,
            } => {
                let Some(container) = vars.get(var) else {
                    return false;
                };
                let Some(needle) = rhs(vars, value, other_var) else {
                    return false;
                };
                contains(container, &needle)
            }

            ConditionDefinition::Expression { expression } => {
                match expr::evaluate(expression, |name| vars.get(name).cloned()) {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(expression = %expression, error = %e, "condition expression resolved to false");
                        false
                    }
                }
            }
        }
    }
}

/// Right-hand side: a second variable wins over the literal when named.
fn rhs(vars: &VarMap, value: &Option<Value>, other_var: &Option<String>) -> Option<Value> {
    if let Some(name) = other_var {
        return vars.get(name).cloned();
    }
    value.clone()
}

fn ordered<F>(
    vars: &VarMap,
    var: &str,
    value: &Option<Value>,
    other_var: &Option<String>,
    check: F,
) -> bool
where
    F: Fn(std::cmp::Ordering) -> bool,
{
    let Some(left) = vars.get(var) else {
        return false;
    };
    let Some(right) = rhs(vars, value, other_var) else {
        return false;
    };
    if let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) {
        return a.partial_cmp(&b).map(&check).unwrap_or(false);
    }
    if let (Value::String(a), Value::String(b)) = (left, &right) {
        return check(a.as_str().cmp(b.as_str()));
    }
    false
}

fn contains(container: &Value, needle: &Value) -> bool {
    match container {
        Value::Array(items) => items.iter().any(|item| expr::value_eq(item, needle)),
        Value::String(text) => match needle {
            Value::String(sub) => text.contains(sub.as_str()),
            _ => false,
        },
        Value::Object(map) => match needle {
            Value::String(key) => map.contains_key(key),
            _ => false,
        },
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, Value)]) -> VarMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn always_true() {
        assert!(ConditionEvaluator::evaluate(
            &ConditionDefinition::Always,
            &VarMap::new()
        ));
    }

    #[test]
    fn equals_requires_present_variable() {
        let cond = ConditionDefinition::equals("status", json!("ok"));
        assert!(ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("status", json!("ok"))])
        ));
        assert!(!ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("status", json!("failed"))])
        ));
        assert!(!ConditionEvaluator::evaluate(&cond, &VarMap::new()));
    }

    #[test]
    fn greater_than_prefers_right_variable() {
        let cond = ConditionDefinition::GreaterThan {
            var: "left".into(),
            value: None,
            other_var: Some("right".into()),
        };
        assert!(ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("left", json!(5)), ("right", json!(3))])
        ));
        assert!(!ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("left", json!(1)), ("right", json!(3))])
        ));
        // missing right variable degrades to false
        assert!(!ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("left", json!(5))])
        ));
    }

    #[test]
    fn less_than_falls_back_to_literal() {
        let cond = ConditionDefinition::LessThan {
            var: "metric".into(),
            value: Some(json!(10)),
            other_var: None,
        };
        assert!(ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("metric", json!(5))])
        ));
        assert!(!ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("metric", json!(12))])
        ));
    }

    #[test]
    fn contains_over_list_string_and_mapping() {
        let cond = ConditionDefinition::Contains {
            var: "items".into(),
            value: Some(json!("a")),
            other_var: None,
        };
        assert!(ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("items", json!(["a", "b"]))])
        ));
        assert!(ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("items", json!("cat"))])
        ));
        assert!(!ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("items", json!(42))])
        ));
    }

    #[test]
    fn expression_errors_resolve_to_false() {
        let cond = ConditionDefinition::expression("missing_var > 1");
        assert!(!ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("existing", json!(1))])
        ));

        let cond = ConditionDefinition::expression("danger()");
        assert!(!ConditionEvaluator::evaluate(&cond, &VarMap::new()));
    }

    #[test]
    fn expression_success() {
        let cond = ConditionDefinition::expression("score > 10 and tag == 'ok'");
        assert!(ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("score", json!(12)), ("tag", json!("ok"))])
        ));
    }

    #[test]
    fn not_equals_treats_missing_as_null() {
        let cond = ConditionDefinition::NotEquals {
            var: "status".into(),
            value: Some(json!("ok")),
            other_var: None,
        };
        assert!(ConditionEvaluator::evaluate(&cond, &VarMap::new()));
        assert!(!ConditionEvaluator::evaluate(
            &cond,
            &vars(&[("status", json!("ok"))])
        ));
    }
}
