use futures::future::BoxFuture;

use crate::definition::AgentDefinition;
use crate::error::Result;
use crate::record::{RunRecord, StepExecutionRecord};
use crate::value::VarMap;

/// Agent definition source. Loading, parsing, and caching from whatever
/// document format is used is entirely this collaborator's concern; the
/// interpreter only consumes validated in-memory definitions.
pub trait AgentRepository: Send + Sync + 'static {
    /// Look up a definition by name. Unknown names fault.
    fn get(&self, name: &str) -> Result<AgentDefinition>;

    /// Enumerate every known definition.
    fn list(&self) -> Result<Vec<AgentDefinition>>;
}

/// Run record sink. File layout and format are not interpreter semantics.
pub trait RunStorage: Send + Sync + 'static {
    /// Persist a completed run record (any terminal status).
    fn persist(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>>;

    /// Append one step attempt to a flow run's audit trail.
    fn persist_step(
        &self,
        run_id: &str,
        record: &StepExecutionRecord,
    ) -> BoxFuture<'_, Result<()>>;
}

/// Text-generation backend for atomic `text` agents.
pub trait TextBackend: Send + Sync + 'static {
    /// Generate a response for the rendered prompt. `options` carries
    /// merged generation options (temperature, model, ...).
    fn generate(&self, prompt: &str, options: &VarMap) -> BoxFuture<'_, Result<String>>;
}

/// Result of a script body execution.
#[derive(Debug, Clone, Default)]
pub struct ScriptOutcome {
    /// Variable bindings produced by the body.
    pub patch: VarMap,
    /// Captured textual output.
    pub stdout: String,
    /// Execution fault, if any. Callers branch on its presence.
    pub error: Option<String>,
}

/// Script backend for atomic `script` agents: runs a body in an isolated
/// scope seeded from the current variables.
pub trait ScriptBackend: Send + Sync + 'static {
    fn run(&self, code: &str, vars: &VarMap) -> BoxFuture<'_, Result<ScriptOutcome>>;
}

/// A tool callable from a step flow.
pub trait StepTool: Send + Sync + 'static {
    /// Tool name used in step definitions.
    fn name(&self) -> &str;

    /// Execute with declared params and the current flow variables.
    fn execute(&self, params: &VarMap, vars: &VarMap) -> BoxFuture<'_, Result<VarMap>>;
}
