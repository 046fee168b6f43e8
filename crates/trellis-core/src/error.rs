use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrellisError {
    // Definition errors
    #[error("invalid agent definition '{agent}': {message}")]
    InvalidDefinition { agent: String, message: String },

    #[error("agent not found: {0}")]
    UnknownAgent(String),

    #[error("step '{step}' not found in flow '{flow}'")]
    UnknownStep { flow: String, step: String },

    #[error("step tool not found: {0}")]
    ToolNotFound(String),

    // Expression sandbox
    #[error("expression rejected: {0}")]
    ExpressionRejected(String),

    #[error("expression evaluation failed: {0}")]
    ExpressionFailed(String),

    // Execution errors
    #[error("missing required variable '{0}'")]
    MissingVariable(String),

    #[error("text backend failed: {0}")]
    BackendFailed(String),

    #[error("script backend failed: {0}")]
    ScriptFailed(String),

    #[error("shell command failed with exit code {code}: {stderr}")]
    ShellFailed { code: i32, stderr: String },

    #[error("shell command timed out after {timeout_secs}s")]
    ShellTimeout { timeout_secs: u64 },

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("run exceeded max total steps ({0})")]
    StepBudgetExceeded(usize),

    #[error("run exceeded max recursion depth ({0})")]
    DepthBudgetExceeded(usize),

    // Chat broker errors
    #[error("a question is already pending")]
    QuestionPending,

    #[error("no question is pending")]
    NoPendingQuestion,

    #[error("timed out waiting for an answer after {timeout_secs}s")]
    AnswerTimeout { timeout_secs: u64 },

    // Storage errors
    #[error("storage error: {0}")]
    Storage(String),

    // Config errors
    #[error("config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TrellisError>;
