//! Run record persistence.
//!
//! One JSON document per run plus a JSONL audit file per step flow.
//! Append-and-flush discipline: a crash mid-run leaves every previously
//! written record intact.

use std::path::PathBuf;
use std::sync::Mutex;

use futures::future::BoxFuture;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use trellis_core::error::{Result, TrellisError};
use trellis_core::record::{RunRecord, StepExecutionRecord};
use trellis_core::traits::RunStorage;

/// Disk-backed storage: `<runs_dir>/<run_id>.json` and
/// `<runs_dir>/<run_id>.steps.jsonl`.
pub struct FileRunStorage {
    runs_dir: PathBuf,
}

impl FileRunStorage {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
        }
    }

    /// Read a persisted run record back.
    pub async fn load(&self, run_id: &str) -> Result<RunRecord> {
        let path = self.runs_dir.join(format!("{run_id}.json"));
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| TrellisError::Storage(format!("{}: {e}", path.display())))?;
        Ok(serde_json::from_str(&text)?)
    }
}

impl RunStorage for FileRunStorage {
    fn persist(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>> {
        let record = record.clone();
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.runs_dir).await?;
            let path = self.runs_dir.join(format!("{}.json", record.run_id));
            let text = serde_json::to_string_pretty(&record)?;
            tokio::fs::write(&path, text).await?;
            debug!(run_id = %record.run_id, path = %path.display(), "run record persisted");
            Ok(())
        })
    }

    fn persist_step(
        &self,
        run_id: &str,
        record: &StepExecutionRecord,
    ) -> BoxFuture<'_, Result<()>> {
        let run_id = run_id.to_string();
        let record = record.clone();
        Box::pin(async move {
            tokio::fs::create_dir_all(&self.runs_dir).await?;
            let path = self.runs_dir.join(format!("{run_id}.steps.jsonl"));
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            let line = format!("{}\n", serde_json::to_string(&record)?);
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

/// In-memory storage for tests and ephemeral runs.
#[derive(Default)]
pub struct MemoryRunStorage {
    records: Mutex<Vec<RunRecord>>,
    steps: Mutex<Vec<(String, StepExecutionRecord)>>,
}

impl MemoryRunStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RunRecord> {
        self.records.lock().expect("storage poisoned").clone()
    }

    pub fn step_records(&self, run_id: &str) -> Vec<StepExecutionRecord> {
        self.steps
            .lock()
            .expect("storage poisoned")
            .iter()
            .filter(|(id, _)| id == run_id)
            .map(|(_, record)| record.clone())
            .collect()
    }
}

impl RunStorage for MemoryRunStorage {
    fn persist(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>> {
        self.records
            .lock()
            .expect("storage poisoned")
            .push(record.clone());
        Box::pin(async { Ok(()) })
    }

    fn persist_step(
        &self,
        run_id: &str,
        record: &StepExecutionRecord,
    ) -> BoxFuture<'_, Result<()>> {
        self.steps
            .lock()
            .expect("storage poisoned")
            .push((run_id.to_string(), record.clone()));
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use trellis_core::record::RunRecord;
    use trellis_core::value::VarMap;

    fn step(step_id: &str, attempt: usize) -> StepExecutionRecord {
        StepExecutionRecord {
            step_id: step_id.to_string(),
            attempt,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            vars_before: VarMap::new(),
            tool_result: None,
            validator_result: None,
            chosen_transition: None,
            error: None,
        }
    }

    #[tokio::test]
    async fn run_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRunStorage::new(dir.path());

        let mut record = RunRecord::started("workflow");
        record.finish_ok();
        storage.persist(&record).await.unwrap();

        let loaded = storage.load(&record.run_id).await.unwrap();
        assert_eq!(loaded.run_id, record.run_id);
        assert!(loaded.is_ok());
    }

    #[tokio::test]
    async fn step_records_append_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRunStorage::new(dir.path());

        storage.persist_step("run-1", &step("a", 1)).await.unwrap();
        storage.persist_step("run-1", &step("a", 2)).await.unwrap();

        let text = std::fs::read_to_string(dir.path().join("run-1.steps.jsonl")).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: StepExecutionRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.attempt, 1);
    }

    #[tokio::test]
    async fn missing_record_is_a_storage_fault() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileRunStorage::new(dir.path());
        assert!(matches!(
            storage.load("nope").await,
            Err(TrellisError::Storage(_))
        ));
    }

    #[tokio::test]
    async fn memory_storage_collects() {
        let storage = MemoryRunStorage::new();
        let mut record = RunRecord::started("x");
        record.finish_ok();
        storage.persist(&record).await.unwrap();
        storage.persist_step("r", &step("s", 1)).await.unwrap();

        assert_eq!(storage.records().len(), 1);
        assert_eq!(storage.step_records("r").len(), 1);
        assert!(storage.step_records("other").is_empty());
    }
}
