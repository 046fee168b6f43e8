use std::collections::VecDeque;
use std::sync::Mutex;

use futures::future::BoxFuture;

use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::TextBackend;
use trellis_core::value::VarMap;

/// Deterministic backend that echoes the prompt behind a prefix.
/// The default for demos and for running workflows without a model.
pub struct StaticTextBackend {
    prefix: String,
}

impl StaticTextBackend {
    pub fn new() -> Self {
        Self {
            prefix: "LLM: ".to_string(),
        }
    }

    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for StaticTextBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TextBackend for StaticTextBackend {
    fn generate(&self, prompt: &str, _options: &VarMap) -> BoxFuture<'_, Result<String>> {
        let reply = format!("{}{}", self.prefix, prompt);
        Box::pin(async move { Ok(reply) })
    }
}

/// Scripted backend replaying a fixed queue of responses. Faults when the
/// queue runs dry, which makes missing-call bugs loud in tests.
pub struct QueueTextBackend {
    responses: Mutex<VecDeque<String>>,
}

impl QueueTextBackend {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

impl TextBackend for QueueTextBackend {
    fn generate(&self, _prompt: &str, _options: &VarMap) -> BoxFuture<'_, Result<String>> {
        let next = self.responses.lock().unwrap().pop_front();
        Box::pin(async move {
            next.ok_or_else(|| {
                TrellisError::BackendFailed("no scripted responses left".to_string())
            })
        })
    }
}
