//! Agent definition repositories.
//!
//! Definitions live as one YAML document per agent. Every load path
//! normalizes (stop flag) and validates before a definition reaches the
//! interpreter; malformed documents fault synchronously, never silently.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use trellis_core::definition::AgentDefinition;
use trellis_core::error::{Result, TrellisError};
use trellis_core::traits::AgentRepository;

/// Directory-backed repository: `<dir>/<name>.yaml`, cached after first load.
pub struct FileAgentRepository {
    dir: PathBuf,
    cache: RwLock<HashMap<String, AgentDefinition>>,
}

impl FileAgentRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_file(&self, path: &Path) -> Result<AgentDefinition> {
        let text = std::fs::read_to_string(path)?;
        let mut def: AgentDefinition = serde_yaml::from_str(&text).map_err(|e| {
            TrellisError::InvalidDefinition {
                agent: path.display().to_string(),
                message: e.to_string(),
            }
        })?;
        def.normalize()?;
        Ok(def)
    }

    /// Write a definition to disk (validating first) and refresh the cache.
    pub fn save(&self, def: &AgentDefinition) -> Result<()> {
        let mut def = def.clone();
        def.normalize()?;
        let text = serde_yaml::to_string(&def).map_err(|e| TrellisError::Storage(e.to_string()))?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}.yaml", def.name));
        std::fs::write(&path, text)?;
        debug!(agent = %def.name, path = %path.display(), "agent definition saved");
        self.cache
            .write()
            .expect("repository cache poisoned")
            .insert(def.name.clone(), def);
        Ok(())
    }
}

impl AgentRepository for FileAgentRepository {
    fn get(&self, name: &str) -> Result<AgentDefinition> {
        if let Some(def) = self
            .cache
            .read()
            .expect("repository cache poisoned")
            .get(name)
        {
            return Ok(def.clone());
        }

        let path = self.dir.join(format!("{name}.yaml"));
        if !path.exists() {
            return Err(TrellisError::UnknownAgent(name.to_string()));
        }
        let def = self.load_file(&path)?;
        if def.name != name {
            return Err(TrellisError::InvalidDefinition {
                agent: name.to_string(),
                message: format!("document declares name '{}'", def.name),
            });
        }
        self.cache
            .write()
            .expect("repository cache poisoned")
            .insert(name.to_string(), def.clone());
        Ok(def)
    }

    fn list(&self) -> Result<Vec<AgentDefinition>> {
        let mut defs = Vec::new();
        if !self.dir.exists() {
            return Ok(defs);
        }
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            match self.load_file(&path) {
                Ok(def) => defs.push(def),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable agent document")
                }
            }
        }
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }
}

/// In-memory repository for tests and programmatic setups.
#[derive(Default)]
pub struct MemoryAgentRepository {
    defs: RwLock<HashMap<String, AgentDefinition>>,
}

impl MemoryAgentRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, mut def: AgentDefinition) -> Result<()> {
        def.normalize()?;
        self.defs
            .write()
            .expect("repository poisoned")
            .insert(def.name.clone(), def);
        Ok(())
    }

    pub fn with(self, def: AgentDefinition) -> Self {
        self.insert(def).expect("invalid definition");
        self
    }
}

impl AgentRepository for MemoryAgentRepository {
    fn get(&self, name: &str) -> Result<AgentDefinition> {
        self.defs
            .read()
            .expect("repository poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| TrellisError::UnknownAgent(name.to_string()))
    }

    fn list(&self) -> Result<Vec<AgentDefinition>> {
        let mut defs: Vec<_> = self
            .defs
            .read()
            .expect("repository poisoned")
            .values()
            .cloned()
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(defs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use trellis_core::definition::{ExecutorKind, LocalVar, VarSpec, STOP_FLAG_VAR};

    fn sample() -> AgentDefinition {
        AgentDefinition::atomic("echo", ExecutorKind::Script)
            .with_inputs(vec![VarSpec::new("text")])
            .with_locals(vec![LocalVar::new("code", json!("text = text"))])
            .with_outputs(vec![VarSpec::new("text")])
    }

    #[test]
    fn save_load_round_trip_preserves_stop_flag() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileAgentRepository::new(dir.path());
        repo.save(&sample()).unwrap();

        // bypass the cache: a fresh repository re-reads from disk
        let fresh = FileAgentRepository::new(dir.path());
        let loaded = fresh.get("echo").unwrap();
        assert_eq!(
            loaded
                .inputs
                .iter()
                .filter(|v| v.name == STOP_FLAG_VAR)
                .count(),
            1
        );
        assert_eq!(
            loaded.inputs.iter().find(|v| v.name == STOP_FLAG_VAR).unwrap().default,
            Some(json!(false))
        );
        assert_eq!(loaded.locals.len(), 1);
    }

    #[test]
    fn unknown_name_faults() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileAgentRepository::new(dir.path());
        assert!(matches!(
            repo.get("ghost"),
            Err(TrellisError::UnknownAgent(_))
        ));
    }

    #[test]
    fn malformed_document_faults_synchronously() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("bad.yaml"), "kind: atomic\n# no name").unwrap();
        let repo = FileAgentRepository::new(dir.path());
        assert!(matches!(
            repo.get("bad"),
            Err(TrellisError::InvalidDefinition { .. })
        ));
    }

    #[test]
    fn list_sorts_and_skips_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FileAgentRepository::new(dir.path());

        let mut second = sample();
        second.name = "zeta".to_string();
        repo.save(&second).unwrap();
        repo.save(&sample()).unwrap();
        std::fs::write(dir.path().join("broken.yaml"), ":::").unwrap();

        let names: Vec<_> = repo.list().unwrap().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["echo", "zeta"]);
    }

    #[test]
    fn memory_repository_round_trip() {
        let repo = MemoryAgentRepository::new().with(sample());
        assert!(repo.get("echo").is_ok());
        assert_eq!(repo.list().unwrap().len(), 1);
        assert!(matches!(
            repo.get("ghost"),
            Err(TrellisError::UnknownAgent(_))
        ));
    }
}
