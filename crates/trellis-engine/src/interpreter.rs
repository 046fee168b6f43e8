//! Recursive graph interpreter.
//!
//! Walks a composite agent's lanes in order (each lane is a completion
//! barrier), gates items on `when` clauses and the stop flag, resolves
//! child scopes from bindings, recurses into nested composites, and merges
//! results back namespaced + flat. Global step and depth budgets are the
//! only defense against cyclic agent references: cycles are never detected
//! statically, only bounded at runtime.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use trellis_core::config::EngineConfig;
use trellis_core::definition::{AgentDefinition, AgentKind, STOP_FLAG_VAR};
use trellis_core::error::{Result, TrellisError};
use trellis_core::record::{BlockedInfo, ExecOutcome, RunRecord, TraceEntry};
use trellis_core::traits::{AgentRepository, RunStorage};
use trellis_core::value::{is_truthy, VarMap};

use crate::executor::AtomicExecutor;
use crate::scope::ExecutionScope;

/// Control-flow result of one agent frame. Blocked unwinds uncaught to the
/// top of the run; outputs are read from the frame's scope by the caller.
enum Flow {
    Done,
    Blocked(BlockedInfo),
}

/// Shared step/depth budget across the entire recursive call tree.
struct RunBudget {
    used: usize,
    max_steps: usize,
    max_depth: usize,
}

impl RunBudget {
    fn charge(&mut self, depth: usize) -> Result<()> {
        if depth > self.max_depth {
            return Err(TrellisError::DepthBudgetExceeded(self.max_depth));
        }
        if self.used >= self.max_steps {
            return Err(TrellisError::StepBudgetExceeded(self.max_steps));
        }
        self.used += 1;
        Ok(())
    }
}

/// Executes agents against a repository snapshot. Stateless across runs;
/// each run owns its scope tree exclusively.
pub struct Interpreter {
    repository: Arc<dyn AgentRepository>,
    executor: AtomicExecutor,
    storage: Arc<dyn RunStorage>,
    config: EngineConfig,
}

impl Interpreter {
    pub fn new(
        repository: Arc<dyn AgentRepository>,
        executor: AtomicExecutor,
        storage: Arc<dyn RunStorage>,
        config: EngineConfig,
    ) -> Self {
        Self {
            repository,
            executor,
            storage,
            config,
        }
    }

    pub fn repository(&self) -> &Arc<dyn AgentRepository> {
        &self.repository
    }

    /// Run an agent to a terminal status and persist the record.
    ///
    /// Unknown top-level names and invalid definitions fault synchronously;
    /// everything that happens after the run starts lands in the record as
    /// ok, blocked, or error.
    pub async fn run(&self, agent: &str, inputs: VarMap) -> Result<RunRecord> {
        let def = self.repository.get(agent)?;
        def.validate()?;

        let mut record = RunRecord::started(agent);
        info!(agent = %agent, run_id = %record.run_id, "run started");

        let missing = missing_inputs(&def, &inputs);
        if !missing.is_empty() {
            record.finish_blocked(blocked_on_inputs(&def, missing));
            self.persist(&record).await;
            return Ok(record);
        }

        let mut scope = seed_scope(&def, inputs);
        let mut budget = RunBudget {
            used: 0,
            max_steps: self.config.max_total_steps,
            max_depth: self.config.max_depth,
        };
        let mut trace = Vec::new();

        let result = async {
            budget.charge(0)?;
            self.execute(&def, &mut scope, &mut budget, 0, &mut trace)
                .await
        }
        .await;

        record.vars = scope.snapshot();
        record.trace = trace;
        record.steps_used = budget.used;

        match result {
            Ok(Flow::Done) => record.finish_ok(),
            Ok(Flow::Blocked(info)) => record.finish_blocked(info),
            Err(e) => {
                warn!(agent = %agent, error = %e, "run failed");
                record.finish_error(e.to_string());
            }
        }

        info!(
            agent = %agent,
            run_id = %record.run_id,
            status = %record.status,
            steps = record.steps_used,
            "run finished"
        );
        self.persist(&record).await;
        Ok(record)
    }

    async fn persist(&self, record: &RunRecord) {
        if let Err(e) = self.storage.persist(record).await {
            warn!(run_id = %record.run_id, error = %e, "failed to persist run record");
        }
    }

    /// Execute one agent frame whose scope has already been seeded.
    fn execute<'a>(
        &'a self,
        def: &'a AgentDefinition,
        scope: &'a mut ExecutionScope,
        budget: &'a mut RunBudget,
        depth: usize,
        trace: &'a mut Vec<TraceEntry>,
    ) -> BoxFuture<'a, Result<Flow>> {
        Box::pin(async move {
            let graph = match &def.kind {
                AgentKind::Atomic { .. } => {
                    match self.executor.run(def, scope.flat()).await? {
                        ExecOutcome::Outputs(outputs) => {
                            for (name, value) in outputs {
                                scope.set(name, value);
                            }
                            return Ok(Flow::Done);
                        }
                        ExecOutcome::Blocked(info) => return Ok(Flow::Blocked(info)),
                    }
                }
                AgentKind::Composite { graph } => graph,
            };

            for (lane_index, lane) in graph.lanes.iter().enumerate() {
                for item in &lane.items {
                    if let Some(when) = &item.when {
                        let holds = scope
                            .get(&when.var)
                            .map(|value| value == &when.equals)
                            .unwrap_or(false);
                        if !holds {
                            debug!(item = %item.id, var = %when.var, "when gate false, skipping");
                            trace.push(TraceEntry::skipped(
                                &item.id,
                                &item.agent,
                                lane_index,
                                "when gate not satisfied",
                            ));
                            continue;
                        }
                    }

                    if scope.get(STOP_FLAG_VAR).map(is_truthy).unwrap_or(false) {
                        debug!(item = %item.id, "stop flag set, skipping silently");
                        continue;
                    }

                    let child_def = self.repository.get(&item.agent)?;
                    let child_inputs = scope.child_inputs(&item.bindings, &item.id);

                    let missing = missing_inputs(&child_def, &child_inputs);
                    if !missing.is_empty() {
                        return Ok(Flow::Blocked(blocked_on_inputs(&child_def, missing)));
                    }

                    budget.charge(depth + 1)?;

                    let mut child_scope = seed_scope(&child_def, child_inputs);
                    let flow = self
                        .execute(&child_def, &mut child_scope, budget, depth + 1, trace)
                        .await?;
                    if let Flow::Blocked(info) = flow {
                        return Ok(Flow::Blocked(info));
                    }

                    let outputs = declared_outputs(&child_def, &child_scope);
                    scope.absorb_child(&item.id, &outputs);
                    scope.apply_context_bindings(&item.bindings, &item.id);
                    scope.apply_context_bindings(&graph.ctx_bindings, &item.id);
                    trace.push(TraceEntry::executed(
                        &item.id,
                        &item.agent,
                        lane_index,
                        outputs,
                    ));
                }
            }

            Ok(Flow::Done)
        })
    }
}

/// Declared, non-defaulted inputs with no supplied value.
fn missing_inputs(def: &AgentDefinition, supplied: &VarMap) -> Vec<String> {
    def.inputs
        .iter()
        .filter(|input| input.default.is_none() && !supplied.contains_key(&input.name))
        .map(|input| input.name.clone())
        .collect()
}

fn blocked_on_inputs(def: &AgentDefinition, missing: Vec<String>) -> BlockedInfo {
    let question = format!(
        "Provide values for '{}': {}",
        def.display_title(),
        missing.join(", ")
    );
    BlockedInfo {
        missing_inputs: missing,
        questions_to_user: vec![question],
        why_blocked: Some(format!("required inputs are not set for '{}'", def.name)),
    }
}

/// Seed a frame scope: supplied values, then input defaults, then locals.
fn seed_scope(def: &AgentDefinition, inputs: VarMap) -> ExecutionScope {
    let mut scope = ExecutionScope::from_flat(inputs);
    for input in &def.inputs {
        if scope.get(&input.name).is_none() {
            if let Some(default) = &input.default {
                scope.set(input.name.clone(), default.clone());
            }
        }
    }
    for local in &def.locals {
        scope.set(local.name.clone(), local.value.clone());
    }
    scope
}

/// An agent's result, filtered to its declared output names.
fn declared_outputs(def: &AgentDefinition, scope: &ExecutionScope) -> VarMap {
    let mut outputs = VarMap::new();
    for output in &def.outputs {
        if let Some(value) = scope.get(&output.name) {
            outputs.insert(output.name.clone(), value.clone());
        }
    }
    outputs
}
