use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value::{Value, VarMap};

/// Terminal status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Blocked,
    Error,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Blocked => write!(f, "blocked"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Payload of a Blocked outcome: what is missing and why.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BlockedInfo {
    #[serde(default)]
    pub missing_inputs: Vec<String>,
    #[serde(default)]
    pub questions_to_user: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_blocked: Option<String>,
}

/// Result of executing one agent: completed outputs, or an unwind request
/// for more external input. Deliberately a value, not an error type, so it
/// cannot be swallowed by `?` on the way up.
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    Outputs(VarMap),
    Blocked(BlockedInfo),
}

/// One executed (or skipped) graph item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEntry {
    pub item_id: String,
    pub agent: String,
    pub lane: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "VarMap::is_empty")]
    pub outputs: VarMap,
}

impl TraceEntry {
    pub fn executed(item_id: &str, agent: &str, lane: usize, outputs: VarMap) -> Self {
        Self {
            item_id: item_id.to_string(),
            agent: agent.to_string(),
            lane,
            skipped: false,
            reason: None,
            outputs,
        }
    }

    pub fn skipped(item_id: &str, agent: &str, lane: usize, reason: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            agent: agent.to_string(),
            lane,
            skipped: true,
            reason: Some(reason.to_string()),
            outputs: VarMap::new(),
        }
    }
}

/// Append-only record of one run. Created at run start, completed by the
/// interpreter, immutable once returned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub agent: String,
    pub status: RunStatus,
    pub vars: VarMap,
    pub trace: Vec<TraceEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_inputs: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub questions_to_user: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub why_blocked: Option<String>,
    pub steps_used: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn started(agent: &str) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            agent: agent.to_string(),
            status: RunStatus::Error,
            vars: VarMap::new(),
            trace: Vec::new(),
            error: None,
            missing_inputs: None,
            questions_to_user: None,
            why_blocked: None,
            steps_used: 0,
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn finish_ok(&mut self) {
        self.status = RunStatus::Ok;
        self.finished_at = Some(Utc::now());
    }

    pub fn finish_blocked(&mut self, info: BlockedInfo) {
        self.status = RunStatus::Blocked;
        self.missing_inputs = Some(info.missing_inputs);
        self.questions_to_user = Some(info.questions_to_user);
        self.why_blocked = info.why_blocked;
        self.finished_at = Some(Utc::now());
    }

    pub fn finish_error(&mut self, message: String) {
        self.status = RunStatus::Error;
        self.error = Some(message);
        self.finished_at = Some(Utc::now());
    }

    pub fn is_ok(&self) -> bool {
        self.status == RunStatus::Ok
    }
}

/// Audit record of one step attempt in a step flow. Appended, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionRecord {
    pub step_id: String,
    pub attempt: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub vars_before: VarMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator_result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chosen_transition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
