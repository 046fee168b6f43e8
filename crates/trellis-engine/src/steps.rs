//! Step-flow runner: named steps with explicit transitions, tool results
//! judged by validator agents whose verdicts drive accept/retry/fail.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use trellis_core::error::{Result, TrellisError};
use trellis_core::flow::{StepDefinition, StepFlowDefinition};
use trellis_core::record::{RunStatus, StepExecutionRecord};
use trellis_core::traits::{RunStorage, StepTool};
use trellis_core::value::{value_to_string, Value, VarMap};

use crate::condition::ConditionEvaluator;
use crate::interpreter::Interpreter;

/// Registered tools callable from step definitions.
#[derive(Default)]
pub struct StepToolRegistry {
    tools: HashMap<String, Arc<dyn StepTool>>,
}

impl StepToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn StepTool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepTool>> {
        self.tools.get(name).cloned()
    }
}

/// Bridges step flows to the agent graph: a tool running a named agent
/// through the interpreter. The `agent` param picks the definition; every
/// other param is forwarded on top of the current flow variables, and the
/// sub-run's final variables become the tool result.
pub struct AgentCallTool {
    interpreter: Arc<Interpreter>,
}

impl AgentCallTool {
    pub fn new(interpreter: Arc<Interpreter>) -> Self {
        Self { interpreter }
    }
}

impl StepTool for AgentCallTool {
    fn name(&self) -> &str {
        "run_agent"
    }

    fn execute(&self, params: &VarMap, vars: &VarMap) -> BoxFuture<'_, Result<VarMap>> {
        let agent = params.get("agent").map(value_to_string);
        let mut inputs = vars.clone();
        for (name, value) in params {
            if name != "agent" {
                inputs.insert(name.clone(), value.clone());
            }
        }
        Box::pin(async move {
            let agent =
                agent.ok_or_else(|| TrellisError::MissingVariable("agent".to_string()))?;
            let record = self.interpreter.run(&agent, inputs).await?;
            match record.status {
                RunStatus::Ok => Ok(record.vars),
                RunStatus::Blocked => Err(TrellisError::Execution(format!(
                    "agent '{agent}' blocked: {}",
                    record.why_blocked.unwrap_or_default()
                ))),
                RunStatus::Error => Err(TrellisError::Execution(format!(
                    "agent '{agent}' failed: {}",
                    record.error.unwrap_or_default()
                ))),
            }
        })
    }
}

/// Validator verdict over a step's tool result.
#[derive(Debug, Clone, PartialEq)]
enum Verdict {
    Accept { patch: Option<VarMap> },
    Retry,
    Fail { reason: String },
}

/// Terminal state of a step-flow run.
#[derive(Debug, Clone)]
pub struct FlowRun {
    pub run_id: String,
    pub flow: String,
    pub finished: bool,
    pub failed: bool,
    pub vars: VarMap,
    pub history: Vec<StepExecutionRecord>,
    pub error: Option<String>,
}

/// Drives step flows. Validators run as full agent invocations through the
/// interpreter; every attempt leaves one StepExecutionRecord.
pub struct StepRunner {
    interpreter: Arc<Interpreter>,
    tools: StepToolRegistry,
    storage: Arc<dyn RunStorage>,
    max_total_steps: usize,
}

impl StepRunner {
    pub fn new(
        interpreter: Arc<Interpreter>,
        tools: StepToolRegistry,
        storage: Arc<dyn RunStorage>,
        max_total_steps: usize,
    ) -> Self {
        Self {
            interpreter,
            tools,
            storage,
            max_total_steps,
        }
    }

    pub async fn run(&self, flow: &StepFlowDefinition, inputs: VarMap) -> Result<FlowRun> {
        flow.validate()?;

        let run_id = Uuid::new_v4().to_string();
        info!(flow = %flow.name, run_id = %run_id, "step flow started");

        let mut run = FlowRun {
            run_id: run_id.clone(),
            flow: flow.name.clone(),
            finished: false,
            failed: false,
            vars: inputs,
            history: Vec::new(),
            error: None,
        };
        let mut retries: HashMap<String, usize> = HashMap::new();
        let mut cursor = Some(flow.entry_step_id.clone());
        let mut executed = 0usize;

        while let Some(step_id) = cursor.take() {
            let step = flow.get_step(&step_id)?;

            if executed >= self.max_total_steps {
                run.failed = true;
                run.error = Some(
                    TrellisError::StepBudgetExceeded(self.max_total_steps).to_string(),
                );
                break;
            }
            executed += 1;

            let attempt = retries.get(&step_id).copied().unwrap_or(0) + 1;
            let started_at = Utc::now();
            let vars_before = run.vars.clone();

            debug!(step = %step_id, attempt, "executing step");

            // Tool invocation, with the save mapping applied on success.
            let mut tool_error: Option<String> = None;
            let mut tool_result: Option<VarMap> = None;
            if let Some(tool_name) = &step.tool_name {
                match self.run_tool(tool_name, step, &run.vars).await {
                    Ok(result) => {
                        apply_save_mapping(&step.save_mapping, &result, &mut run.vars);
                        tool_result = Some(result);
                    }
                    Err(e) => tool_error = Some(e.to_string()),
                }
            }

            // Verdict: a tool fault fails the step outright; otherwise the
            // validator (when named) judges the attempt.
            let mut validator_result: Option<Value> = None;
            let verdict = if let Some(reason) = &tool_error {
                Verdict::Fail {
                    reason: reason.clone(),
                }
            } else if let Some(validator) = &step.validator_agent {
                let (verdict, raw) = self
                    .run_validator(validator, step, &run_id, attempt, &vars_before, &run.vars, &tool_result)
                    .await;
                validator_result = raw;
                verdict
            } else {
                Verdict::Accept { patch: None }
            };

            // Retry only while the per-step budget allows; beyond it the
            // verdict is coerced to fail.
            let verdict = match verdict {
                Verdict::Retry if attempt > step.max_retries => Verdict::Fail {
                    reason: format!(
                        "validator kept rejecting after {} attempts",
                        attempt
                    ),
                },
                other => other,
            };

            let mut record = StepExecutionRecord {
                step_id: step_id.clone(),
                attempt,
                started_at,
                finished_at: Utc::now(),
                vars_before,
                tool_result: tool_result.map(|m| json!(m)),
                validator_result,
                chosen_transition: None,
                error: tool_error.clone(),
            };

            match verdict {
                Verdict::Accept { patch } => {
                    if let Some(patch) = patch {
                        for (name, value) in patch {
                            run.vars.insert(name, value);
                        }
                    }
                    let next = if flow.end_step_ids.contains(&step_id) {
                        None
                    } else {
                        select_transition(step, &run.vars)
                    };
                    record.chosen_transition = next.clone();
                    match next {
                        Some(target) => cursor = Some(target),
                        None => run.finished = true,
                    }
                }
                Verdict::Retry => {
                    retries.insert(step_id.clone(), attempt);
                    cursor = Some(step_id.clone());
                }
                Verdict::Fail { reason } => {
                    warn!(step = %step_id, reason = %reason, "step failed");
                    run.failed = true;
                    if record.error.is_none() {
                        record.error = Some(reason.clone());
                    }
                    run.error = Some(reason);
                }
            }

            if let Err(e) = self.storage.persist_step(&run_id, &record).await {
                warn!(run_id = %run_id, error = %e, "failed to persist step record");
            }
            run.history.push(record);
        }

        if !run.failed {
            run.finished = true;
        }
        info!(
            flow = %flow.name,
            run_id = %run_id,
            finished = run.finished,
            failed = run.failed,
            attempts = run.history.len(),
            "step flow done"
        );
        Ok(run)
    }

    async fn run_tool(
        &self,
        tool_name: &str,
        step: &StepDefinition,
        vars: &VarMap,
    ) -> Result<VarMap> {
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| TrellisError::ToolNotFound(tool_name.to_string()))?;
        tool.execute(&step.tool_params, vars).await
    }

    /// Run the validator as an independent full agent invocation and map
    /// its `validation` object to a verdict. Anything short of a clean
    /// accept/retry (a failed run, a blocked run, a missing or
    /// unrecognized status) fails closed.
    async fn run_validator(
        &self,
        validator: &str,
        step: &StepDefinition,
        run_id: &str,
        attempt: usize,
        vars_before: &VarMap,
        vars_after: &VarMap,
        tool_result: &Option<VarMap>,
    ) -> (Verdict, Option<Value>) {
        let mut inputs = VarMap::new();
        inputs.insert("run_id".to_string(), json!(run_id));
        inputs.insert("step_id".to_string(), json!(step.id));
        inputs.insert("tool_name".to_string(), json!(step.tool_name));
        inputs.insert("attempt".to_string(), json!(attempt));
        inputs.insert("vars_before".to_string(), json!(vars_before));
        inputs.insert("vars_after".to_string(), json!(vars_after));
        inputs.insert("tool_result".to_string(), json!(tool_result));
        for (name, value) in &step.validator_params {
            inputs.insert(name.clone(), value.clone());
        }

        let record = match self.interpreter.run(validator, inputs).await {
            Ok(record) => record,
            Err(e) => {
                return (
                    Verdict::Fail {
                        reason: format!("validator '{validator}' failed: {e}"),
                    },
                    None,
                )
            }
        };

        if record.status != RunStatus::Ok {
            return (
                Verdict::Fail {
                    reason: format!(
                        "validator '{validator}' ended {}",
                        record.status
                    ),
                },
                None,
            );
        }

        let validation = record.vars.get("validation").cloned();
        let verdict = parse_verdict(validation.as_ref(), validator);
        (verdict, validation)
    }
}

fn parse_verdict(validation: Option<&Value>, validator: &str) -> Verdict {
    let Some(object) = validation.and_then(Value::as_object) else {
        return Verdict::Fail {
            reason: format!("validator '{validator}' produced no validation object"),
        };
    };
    match object.get("status").and_then(Value::as_str) {
        Some("accept") => {
            let patch = object.get("patch").and_then(Value::as_object).map(|map| {
                map.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<VarMap>()
            });
            Verdict::Accept { patch }
        }
        Some("retry") => Verdict::Retry,
        Some("fail") => Verdict::Fail {
            reason: object
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or("validator rejected the result")
                .to_string(),
        },
        other => Verdict::Fail {
            reason: format!(
                "validator '{validator}' returned unrecognized status {other:?}"
            ),
        },
    }
}

/// First transition whose condition holds; `always` is a catch-all.
fn select_transition(step: &StepDefinition, vars: &VarMap) -> Option<String> {
    for transition in &step.transitions {
        if ConditionEvaluator::evaluate(&transition.condition, vars) {
            return Some(transition.target_step_id.clone());
        }
    }
    None
}

/// Copy tool-result values into flow variables along dotted paths.
/// Missing paths are skipped.
fn apply_save_mapping(
    mapping: &HashMap<String, String>,
    result: &VarMap,
    vars: &mut VarMap,
) {
    for (dest, path) in mapping {
        if let Some(value) = lookup_path(result, path) {
            vars.insert(dest.clone(), value);
        }
    }
}

fn lookup_path(result: &VarMap, path: &str) -> Option<Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = result.get(first)?.clone();
    for segment in segments {
        current = current.get(segment)?.clone();
    }
    Some(current)
}
