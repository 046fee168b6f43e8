//! Atomic agent executor: dispatches to the text, script, or shell backend
//! and filters results to the agent's declared output names.

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use std::sync::OnceLock;
use tracing::{debug, warn};

use trellis_core::definition::{AgentDefinition, AgentKind, ExecutorKind};
use trellis_core::error::{Result, TrellisError};
use trellis_core::record::{BlockedInfo, ExecOutcome};
use trellis_core::traits::{ScriptBackend, TextBackend};
use trellis_core::value::{is_truthy, value_to_string, Value, VarMap};

use crate::chat::ChatBroker;
use crate::json_extract::extract_first_json;

const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 60;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap())
}

/// Substitute `{var}` placeholders from the scope. Unresolved placeholders
/// pass through literally, never fault.
pub fn render_template(template: &str, vars: &VarMap) -> String {
    placeholder_re()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            match vars.get(&caps[1]) {
                Some(value) => value_to_string(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Stateless dispatcher for atomic agents. Safe to share across runs.
pub struct AtomicExecutor {
    text: Arc<dyn TextBackend>,
    script: Arc<dyn ScriptBackend>,
    chat: Option<Arc<ChatBroker>>,
    answer_timeout: Duration,
}

impl AtomicExecutor {
    pub fn new(text: Arc<dyn TextBackend>, script: Arc<dyn ScriptBackend>) -> Self {
        Self {
            text,
            script,
            chat: None,
            answer_timeout: Duration::from_secs(300),
        }
    }

    /// Attach the human-in-the-loop broker. When a text agent reports
    /// itself blocked, its first question is relayed to the broker and the
    /// run waits up to `answer_timeout` for a reply before blocking.
    pub fn with_chat(mut self, chat: Arc<ChatBroker>, answer_timeout: Duration) -> Self {
        self.chat = Some(chat);
        self.answer_timeout = answer_timeout;
        self
    }

    pub async fn run(&self, def: &AgentDefinition, vars: &VarMap) -> Result<ExecOutcome> {
        let executor = match &def.kind {
            AgentKind::Atomic { executor } => *executor,
            AgentKind::Composite { .. } => {
                return Err(TrellisError::InvalidDefinition {
                    agent: def.name.clone(),
                    message: "composite agent dispatched to the atomic executor".to_string(),
                })
            }
        };

        debug!(agent = %def.name, executor = %executor, "executing atomic agent");

        match executor {
            ExecutorKind::Text => self.run_text(def, vars).await,
            ExecutorKind::Script => self.run_script(def, vars).await,
            ExecutorKind::Shell => self.run_shell(def, vars).await,
        }
    }

    async fn run_text(&self, def: &AgentDefinition, vars: &VarMap) -> Result<ExecOutcome> {
        let template = vars
            .get("prompt")
            .map(value_to_string)
            .unwrap_or_default();
        let prompt = render_template(&template, vars);
        let options = generation_options(vars);

        let response = self.text.generate(&prompt, &options).await?;

        let parse_json = vars.get("parse_json").map(is_truthy).unwrap_or(true);
        let (parsed, json_error) = if parse_json {
            extract_first_json(&response)
        } else {
            (None, None)
        };

        if let Some(info) = blocked_signal(parsed.as_ref()) {
            if let Some(answer) = self.relay_to_user(&def.name, &info).await {
                let mut outputs = VarMap::new();
                for output in &def.outputs {
                    if output.name == "user_answer" || output.name == "answer" {
                        outputs.insert(output.name.clone(), Value::String(answer.clone()));
                    }
                }
                if !outputs.is_empty() {
                    return Ok(ExecOutcome::Outputs(outputs));
                }
            }
            return Ok(ExecOutcome::Blocked(info));
        }

        let mut outputs = VarMap::new();
        for output in &def.outputs {
            match output.name.as_str() {
                "output_text" | "text" | "result" => {
                    outputs.insert(output.name.clone(), Value::String(response.clone()));
                }
                "parsed_json" => {
                    if let Some(value) = &parsed {
                        outputs.insert(output.name.clone(), value.clone());
                    }
                }
                "json_error" => {
                    if let Some(error) = &json_error {
                        outputs.insert(output.name.clone(), Value::String(error.clone()));
                    }
                }
                other => {
                    // alias: a parsed key when present, the raw text otherwise
                    let value = parsed
                        .as_ref()
                        .and_then(|p| p.get(other))
                        .cloned()
                        .unwrap_or_else(|| Value::String(response.clone()));
                    outputs.insert(output.name.clone(), value);
                }
            }
        }
        Ok(ExecOutcome::Outputs(outputs))
    }

    async fn run_script(&self, def: &AgentDefinition, vars: &VarMap) -> Result<ExecOutcome> {
        let code = vars.get("code").map(value_to_string).unwrap_or_default();

        let outcome = match self.script.run(&code, vars).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // script bodies fail routinely; callers branch on the error output
                warn!(agent = %def.name, error = %e, "script backend fault captured");
                trellis_core::traits::ScriptOutcome {
                    patch: VarMap::new(),
                    stdout: String::new(),
                    error: Some(e.to_string()),
                }
            }
        };

        let mut outputs = VarMap::new();
        for output in &def.outputs {
            if let Some(value) = outcome.patch.get(&output.name) {
                outputs.insert(output.name.clone(), value.clone());
                continue;
            }
            match output.name.as_str() {
                "stdout" => {
                    outputs.insert(output.name.clone(), Value::String(outcome.stdout.clone()));
                }
                "error" => {
                    if let Some(error) = &outcome.error {
                        outputs.insert(output.name.clone(), Value::String(error.clone()));
                    }
                }
                _ => {}
            }
        }
        Ok(ExecOutcome::Outputs(outputs))
    }

    async fn run_shell(&self, def: &AgentDefinition, vars: &VarMap) -> Result<ExecOutcome> {
        let argv = shell_argv(vars)?;
        let cwd = vars.get("cwd").map(value_to_string);
        let timeout_secs = vars
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_SHELL_TIMEOUT_SECS);
        let allow_failure = vars.get("allow_failure").map(is_truthy).unwrap_or(false);

        debug!(command = %argv.join(" "), "running shell command");

        let mut command = tokio::process::Command::new(&argv[0]);
        command.args(&argv[1..]).kill_on_drop(true);
        if let Some(dir) = &cwd {
            command.current_dir(dir);
        }

        let output = tokio::time::timeout(Duration::from_secs(timeout_secs), command.output())
            .await
            .map_err(|_| TrellisError::ShellTimeout { timeout_secs })?
            .map_err(|e| TrellisError::ShellFailed {
                code: -1,
                stderr: e.to_string(),
            })?;

        let code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if code != 0 && !allow_failure {
            return Err(TrellisError::ShellFailed { code, stderr });
        }

        let mut outputs = VarMap::new();
        for output_spec in &def.outputs {
            let value = match output_spec.name.as_str() {
                "return_code" | "exit_code" => Value::from(code),
                "stdout" => Value::String(stdout.clone()),
                "stderr" => Value::String(stderr.clone()),
                "ok" => Value::Bool(code == 0),
                _ => continue,
            };
            outputs.insert(output_spec.name.clone(), value);
        }
        Ok(ExecOutcome::Outputs(outputs))
    }

    /// Relay a blocked agent's first question through the chat broker and
    /// wait for a human reply. Any broker fault (timeout included) resolves
    /// to None, letting the blocked outcome stand rather than crashing.
    async fn relay_to_user(&self, agent: &str, info: &BlockedInfo) -> Option<String> {
        let chat = self.chat.as_ref()?;
        let question = info.questions_to_user.first()?;

        if let Err(e) = chat.ask(agent, question).await {
            warn!(agent = %agent, error = %e, "could not post question");
            return None;
        }
        match chat.wait_for_answer(self.answer_timeout).await {
            Ok(answer) => Some(answer),
            Err(e) => {
                warn!(agent = %agent, error = %e, "no answer before timeout, blocking run");
                None
            }
        }
    }
}

/// Merged generation options: the `options` mapping plus well-known
/// scalar variables.
fn generation_options(vars: &VarMap) -> VarMap {
    let mut options = VarMap::new();
    if let Some(Value::Object(map)) = vars.get("options") {
        for (key, value) in map {
            options.insert(key.clone(), value.clone());
        }
    }
    for key in ["temperature", "max_tokens", "top_p", "host", "model"] {
        if let Some(value) = vars.get(key) {
            options.insert(key.to_string(), value.clone());
        }
    }
    options
}

fn shell_argv(vars: &VarMap) -> Result<Vec<String>> {
    let command = vars
        .get("command")
        .ok_or_else(|| TrellisError::MissingVariable("command".to_string()))?;
    let argv: Vec<String> = match command {
        Value::Array(parts) => parts.iter().map(value_to_string).collect(),
        other => value_to_string(other)
            .split_whitespace()
            .map(str::to_string)
            .collect(),
    };
    if argv.is_empty() {
        return Err(TrellisError::MissingVariable("command".to_string()));
    }
    Ok(argv)
}

/// Recognize the blocked self-report in a parsed text response.
fn blocked_signal(parsed: Option<&Value>) -> Option<BlockedInfo> {
    let object = parsed?.as_object()?;
    let status = object.get("status")?.as_str()?;
    if status != "blocked" {
        return None;
    }

    let missing_inputs = string_list(object.get("missing_inputs"));
    let mut questions = string_list(object.get("questions_to_user"));
    if questions.is_empty() {
        questions = string_list(object.get("clarifications"));
    }
    let why_blocked = object
        .get("why_blocked")
        .or_else(|| object.get("reason"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Some(BlockedInfo {
        missing_inputs,
        questions_to_user: questions,
        why_blocked,
    })
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().map(value_to_string).collect(),
        Some(Value::String(s)) if !s.is_empty() => vec![s.clone()],
        _ => Vec::new(),
    }
}
