pub mod chat;
pub mod condition;
pub mod executor;
pub mod expr;
pub mod interpreter;
pub mod json_extract;
pub mod scope;
pub mod steps;

pub use chat::{ChatBroker, ChatMessage, ChatMessageKind};
pub use condition::ConditionEvaluator;
pub use executor::{render_template, AtomicExecutor};
pub use interpreter::Interpreter;
pub use json_extract::extract_first_json;
pub use scope::ExecutionScope;
pub use steps::{AgentCallTool, FlowRun, StepRunner, StepToolRegistry};
