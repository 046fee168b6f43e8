use std::process::Stdio;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::{ScriptBackend, ScriptOutcome};
use trellis_core::value::VarMap;

/// Stdin/stdout protocol shim executed by the default interpreter: reads
/// `{"code": ..., "vars": ...}`, executes the body in a scope seeded from
/// the variables with `print` captured, and replies
/// `{"patch": ..., "stdout": ..., "error": ...}` where the patch is every
/// JSON-representable binding left in the scope.
const PYTHON_RUNNER: &str = r#"
import json, sys
payload = json.load(sys.stdin)
scope = dict(payload.get("vars") or {})
lines = []
scope["print"] = lambda *a, **k: lines.append(" ".join(map(str, a)))
error = None
try:
    exec(compile(payload.get("code") or "", "<agent_code>", "exec"), scope, scope)
except Exception as exc:
    error = str(exc)
patch = {}
for key, value in scope.items():
    if key == "print":
        continue
    try:
        json.dumps(value)
    except Exception:
        continue
    patch[key] = value
json.dump({"patch": patch, "stdout": "\n".join(lines), "error": error}, sys.stdout)
"#;

#[derive(Deserialize)]
struct RunnerReply {
    #[serde(default)]
    patch: VarMap,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    error: Option<String>,
}

/// Script backend delegating to an interpreter subprocess.
///
/// The interpreter argv receives `{code, vars}` as JSON on stdin and must
/// reply with `{patch, stdout, error}` on stdout. The default argv runs
/// the bundled Python shim.
pub struct InterpreterScriptBackend {
    argv: Vec<String>,
    timeout: Duration,
}

impl InterpreterScriptBackend {
    /// Backend using the bundled `python3` shim.
    pub fn python(timeout_secs: u64) -> Self {
        Self {
            argv: vec![
                "python3".to_string(),
                "-c".to_string(),
                PYTHON_RUNNER.to_string(),
            ],
            timeout: Duration::from_secs(timeout_secs),
        }
    }

    /// Backend using a custom interpreter argv speaking the same protocol.
    pub fn with_argv(argv: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            argv,
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

impl ScriptBackend for InterpreterScriptBackend {
    fn run(&self, code: &str, vars: &VarMap) -> BoxFuture<'_, Result<ScriptOutcome>> {
        let payload = json!({ "code": code, "vars": vars }).to_string();
        Box::pin(async move {
            if self.argv.is_empty() {
                return Err(TrellisError::ScriptFailed(
                    "no interpreter configured".to_string(),
                ));
            }

            debug!(interpreter = %self.argv[0], "running script body");

            let mut child = tokio::process::Command::new(&self.argv[0])
                .args(&self.argv[1..])
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    TrellisError::ScriptFailed(format!("failed to spawn interpreter: {e}"))
                })?;

            let mut stdin = child.stdin.take().ok_or_else(|| {
                TrellisError::ScriptFailed("interpreter stdin unavailable".to_string())
            })?;
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|e| TrellisError::ScriptFailed(e.to_string()))?;
            drop(stdin);

            let output = tokio::time::timeout(self.timeout, child.wait_with_output())
                .await
                .map_err(|_| {
                    TrellisError::ScriptFailed(format!(
                        "interpreter timed out after {}s",
                        self.timeout.as_secs()
                    ))
                })?
                .map_err(|e| TrellisError::ScriptFailed(e.to_string()))?;

            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(TrellisError::ScriptFailed(format!(
                    "interpreter exited with {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                )));
            }

            let reply: RunnerReply =
                serde_json::from_slice(&output.stdout).map_err(|e| {
                    TrellisError::ScriptFailed(format!("malformed interpreter reply: {e}"))
                })?;

            Ok(ScriptOutcome {
                patch: reply.patch,
                stdout: reply.stdout,
                error: reply.error,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn has_python() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    #[tokio::test]
    async fn script_patch_and_stdout() {
        if !has_python() {
            return;
        }
        let backend = InterpreterScriptBackend::python(10);
        let mut vars = VarMap::new();
        vars.insert("x".to_string(), json!(3));

        let outcome = backend
            .run("y = x * 2\nprint('doubled', y)", &vars)
            .await
            .unwrap();
        assert_eq!(outcome.patch.get("y"), Some(&json!(6)));
        assert_eq!(outcome.stdout, "doubled 6");
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn script_fault_lands_in_error_field() {
        if !has_python() {
            return;
        }
        let backend = InterpreterScriptBackend::python(10);
        let outcome = backend.run("raise ValueError('nope')", &VarMap::new()).await.unwrap();
        assert_eq!(outcome.error.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn missing_interpreter_is_a_hard_fault() {
        let backend =
            InterpreterScriptBackend::with_argv(vec!["definitely-not-a-binary".to_string()], 5);
        let result = backend.run("x = 1", &VarMap::new()).await;
        assert!(matches!(result, Err(TrellisError::ScriptFailed(_))));
    }
}
