use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TrellisError};

/// Top-level Trellis configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub script: ScriptConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| TrellisError::Config(e.to_string()))
    }

    /// Load the config file, falling back to defaults when it is absent.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Run budgets and chat timing. The step/depth budgets are the only
/// defense against cyclic agent references.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_total_steps")]
    pub max_total_steps: usize,
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,
    #[serde(default = "default_answer_timeout")]
    pub answer_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_total_steps: default_max_total_steps(),
            max_depth: default_max_depth(),
            answer_timeout_secs: default_answer_timeout(),
        }
    }
}

fn default_max_total_steps() -> usize {
    200
}

fn default_max_depth() -> usize {
    16
}

fn default_answer_timeout() -> u64 {
    300
}

/// Text-generation backend selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// "static" (deterministic echo) or "ollama".
    #[serde(default = "default_backend_kind")]
    pub kind: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_backend_timeout(),
        }
    }
}

fn default_backend_kind() -> String {
    "static".to_string()
}

fn default_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_model() -> String {
    "qwen3:32b".to_string()
}

fn default_backend_timeout() -> u64 {
    60
}

/// Script backend: the interpreter argv receiving `{code, vars}` on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptConfig {
    #[serde(default)]
    pub interpreter: Vec<String>,
    #[serde(default = "default_script_timeout")]
    pub timeout_secs: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            interpreter: Vec::new(),
            timeout_secs: default_script_timeout(),
        }
    }
}

fn default_script_timeout() -> u64 {
    30
}

/// HTTP surface binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8600".to_string()
}

/// On-disk locations for agent documents and run records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_agents_dir")]
    pub agents_dir: PathBuf,
    #[serde(default = "default_runs_dir")]
    pub runs_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            agents_dir: default_agents_dir(),
            runs_dir: default_runs_dir(),
        }
    }
}

fn default_agents_dir() -> PathBuf {
    PathBuf::from("agents")
}

fn default_runs_dir() -> PathBuf {
    PathBuf::from("runs")
}
