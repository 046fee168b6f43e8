pub mod ollama;
pub mod script;
pub mod statictext;

pub use ollama::OllamaBackend;
pub use script::InterpreterScriptBackend;
pub use statictext::{QueueTextBackend, StaticTextBackend};

use std::sync::Arc;

use trellis_core::config::{BackendConfig, ScriptConfig};
use trellis_core::traits::{ScriptBackend, TextBackend};

/// Text backend selected by configuration.
pub fn text_backend_from_config(config: &BackendConfig) -> Arc<dyn TextBackend> {
    match config.kind.as_str() {
        "ollama" => Arc::new(OllamaBackend::new(
            config.base_url.clone(),
            config.model.clone(),
            config.timeout_secs,
        )),
        _ => Arc::new(StaticTextBackend::new()),
    }
}

/// Script backend selected by configuration: a custom interpreter argv, or
/// the bundled python3 shim.
pub fn script_backend_from_config(config: &ScriptConfig) -> Arc<dyn ScriptBackend> {
    if config.interpreter.is_empty() {
        Arc::new(InterpreterScriptBackend::python(config.timeout_secs))
    } else {
        Arc::new(InterpreterScriptBackend::with_argv(
            config.interpreter.clone(),
            config.timeout_secs,
        ))
    }
}
