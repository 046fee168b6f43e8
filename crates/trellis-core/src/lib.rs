pub mod condition;
pub mod config;
pub mod definition;
pub mod error;
pub mod flow;
pub mod record;
pub mod traits;
pub mod value;

pub use condition::ConditionDefinition;
pub use config::AppConfig;
pub use definition::{
    AgentDefinition, AgentKind, Binding, ExecutorKind, Graph, GraphItem, Lane, LocalVar,
    UiPlacement, VarSpec, WhenClause, CONTEXT_ENDPOINT, STOP_FLAG_VAR,
};
pub use error::{Result, TrellisError};
pub use flow::{StepDefinition, StepFlowDefinition, TransitionDefinition};
pub use record::{
    BlockedInfo, ExecOutcome, RunRecord, RunStatus, StepExecutionRecord, TraceEntry,
};
pub use value::{is_truthy, value_to_string, Value, VarMap};
